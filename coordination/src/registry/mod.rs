//! Worker registry: name → factory, with per-session instances and health.
//!
//! Registration order is the deterministic tie-breaker used everywhere a
//! list of workers is produced. Capabilities are read once from a probe
//! instance at registration time, so capability lookups never call into a
//! worker.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::worker::{Capability, FailureKind, SharedWorker, Worker};

/// Builds a fresh worker instance.
pub type WorkerFactory = Arc<dyn Fn() -> SharedWorker + Send + Sync>;

/// Shared reference to a WorkerRegistry
pub type SharedRegistry = Arc<WorkerRegistry>;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Invalid worker name: {0:?}")]
    InvalidName(String),
}

/// Rolling health counters for a registered worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Average latency of successful answers in milliseconds
    pub avg_latency_ms: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Subset of failures that were timeouts or budget cut-offs
    pub timeout_count: u64,
    pub last_error: Option<String>,
}

impl WorkerHealth {
    /// Compute success rate (0.0 - 1.0)
    pub fn success_rate(&self) -> f32 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f32 / total as f32
        }
    }

    pub fn record_success(&mut self, latency_ms: u64) {
        self.avg_latency_ms =
            (self.avg_latency_ms * self.success_count + latency_ms) / (self.success_count + 1);
        self.success_count += 1;
    }

    pub fn record_failure(&mut self, kind: &FailureKind) {
        self.failure_count += 1;
        let message = match kind {
            FailureKind::Scoring { message } | FailureKind::Execution { message } => {
                message.clone()
            }
            FailureKind::Timeout { after_ms } => {
                self.timeout_count += 1;
                format!("timed out after {after_ms}ms")
            }
            FailureKind::BudgetExhausted { after_ms } => {
                self.timeout_count += 1;
                format!("cut off by time budget after {after_ms}ms")
            }
        };
        self.last_error = Some(message);
    }
}

/// Public view of one registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,
    pub variant: String,
    pub capabilities: Vec<Capability>,
    /// Position in registration order (stable across re-registration)
    pub order: u64,
    /// Bumped each time the name is registered again
    pub generation: u64,
    pub health: WorkerHealth,
}

struct Registration {
    order: u64,
    generation: u64,
    factory: WorkerFactory,
    variant: String,
    capabilities: BTreeSet<Capability>,
    health: WorkerHealth,
}

impl Registration {
    fn info(&self, name: &str) -> WorkerInfo {
        WorkerInfo {
            name: name.to_string(),
            variant: self.variant.clone(),
            capabilities: self.capabilities.iter().cloned().collect(),
            order: self.order,
            generation: self.generation,
            health: self.health.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    registrations: HashMap<String, Registration>,
    /// (session id, worker name) → instance
    instances: HashMap<(String, String), SharedWorker>,
    next_order: u64,
}

impl Inner {
    fn ordered(&self) -> Vec<(&String, &Registration)> {
        let mut regs: Vec<_> = self.registrations.iter().collect();
        regs.sort_by_key(|(_, r)| r.order);
        regs
    }
}

/// Name-keyed worker registry.
///
/// Readable concurrently; every mutation happens under its own write lock,
/// which is never held while a factory or worker runs.
#[derive(Default)]
pub struct WorkerRegistry {
    inner: RwLock<Inner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this registry
    pub fn shared(self) -> SharedRegistry {
        Arc::new(self)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or replace) the factory for `name`.
    ///
    /// Re-registering keeps the original registration order and leaves
    /// instances already handed to sessions in place. Returns true when an
    /// existing registration was replaced.
    pub fn register(&self, name: &str, factory: WorkerFactory) -> Result<bool, RegistryError> {
        if name.trim().is_empty() {
            return Err(RegistryError::InvalidName(name.to_string()));
        }

        let probe = factory();
        let variant = probe.variant().to_string();
        let capabilities = probe.capabilities().clone();
        drop(probe);

        let mut inner = self.write();
        let next_order = inner.next_order;
        let replaced = match inner.registrations.get_mut(name) {
            Some(existing) => {
                existing.factory = factory;
                existing.variant = variant;
                existing.capabilities = capabilities;
                existing.generation += 1;
                info!(worker = %name, generation = existing.generation, "Worker re-registered");
                true
            }
            None => {
                inner.registrations.insert(
                    name.to_string(),
                    Registration {
                        order: next_order,
                        generation: 1,
                        factory,
                        variant,
                        capabilities,
                        health: WorkerHealth::default(),
                    },
                );
                inner.next_order += 1;
                info!(worker = %name, "Worker registered");
                false
            }
        };
        Ok(replaced)
    }

    /// Convenience wrapper around [`register`](Self::register) for a
    /// concrete worker type.
    pub fn register_worker<W, F>(&self, name: &str, build: F) -> Result<bool, RegistryError>
    where
        W: Worker + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        self.register(name, Arc::new(move || Arc::new(build()) as SharedWorker))
    }

    /// Remove a registration and every instance built from it.
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.write();
        let removed = inner.registrations.remove(name).is_some();
        if removed {
            inner.instances.retain(|(_, worker), _| worker != name);
            info!(worker = %name, "Worker unregistered");
        }
        removed
    }

    /// Worker instance bound to `session_id`, built on first use.
    ///
    /// Instances are never shared between sessions.
    pub fn get_or_create(&self, name: &str, session_id: &str) -> Result<SharedWorker, RegistryError> {
        let key = (session_id.to_string(), name.to_string());
        let factory = {
            let inner = self.read();
            let registration = inner
                .registrations
                .get(name)
                .ok_or_else(|| RegistryError::UnknownWorker(name.to_string()))?;
            if let Some(worker) = inner.instances.get(&key) {
                return Ok(worker.clone());
            }
            registration.factory.clone()
        };

        let built = factory();

        let mut inner = self.write();
        if !inner.registrations.contains_key(name) {
            return Err(RegistryError::UnknownWorker(name.to_string()));
        }
        let worker = inner.instances.entry(key).or_insert(built).clone();
        debug!(worker = %name, session_id = %session_id, "Worker instance ready");
        Ok(worker)
    }

    /// Drop every instance bound to `session_id`.
    pub fn release_session(&self, session_id: &str) -> usize {
        let mut inner = self.write();
        let before = inner.instances.len();
        inner.instances.retain(|(session, _), _| session != session_id);
        before - inner.instances.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().registrations.contains_key(name)
    }

    /// Registration position of `name`.
    pub fn order_of(&self, name: &str) -> Option<u64> {
        self.read().registrations.get(name).map(|r| r.order)
    }

    /// All registered names in registration order.
    pub fn list_names(&self) -> Vec<String> {
        self.read()
            .ordered()
            .into_iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Names declaring `capability`, in registration order.
    pub fn list_by_capability(&self, capability: &Capability) -> Vec<String> {
        self.read()
            .ordered()
            .into_iter()
            .filter(|(_, r)| r.capabilities.contains(capability))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Every declared capability with the workers declaring it.
    pub fn list_capabilities(&self) -> BTreeMap<Capability, Vec<String>> {
        let inner = self.read();
        let mut out: BTreeMap<Capability, Vec<String>> = BTreeMap::new();
        for (name, registration) in inner.ordered() {
            for capability in &registration.capabilities {
                out.entry(capability.clone()).or_default().push(name.clone());
            }
        }
        out
    }

    pub fn info(&self, name: &str) -> Result<WorkerInfo, RegistryError> {
        self.read()
            .registrations
            .get(name)
            .map(|r| r.info(name))
            .ok_or_else(|| RegistryError::UnknownWorker(name.to_string()))
    }

    /// Every registration in registration order.
    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.read()
            .ordered()
            .into_iter()
            .map(|(name, r)| r.info(name))
            .collect()
    }

    pub fn record_success(&self, name: &str, latency_ms: u64) {
        if let Some(r) = self.write().registrations.get_mut(name) {
            r.health.record_success(latency_ms);
        }
    }

    pub fn record_failure(&self, name: &str, kind: &FailureKind) {
        if let Some(r) = self.write().registrations.get_mut(name) {
            r.health.record_failure(kind);
        }
    }

    pub fn len(&self) -> usize {
        self.read().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live per-session instances.
    pub fn instance_count(&self) -> usize {
        self.read().instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Context;
    use crate::worker::{CallContext, WorkerError, WorkerReply};
    use async_trait::async_trait;

    struct Fixed {
        variant: &'static str,
        capabilities: BTreeSet<Capability>,
    }

    impl Fixed {
        fn new(variant: &'static str, caps: &[&str]) -> Self {
            Self {
                variant,
                capabilities: caps.iter().map(|c| Capability::from(*c)).collect(),
            }
        }
    }

    #[async_trait]
    impl Worker for Fixed {
        fn variant(&self) -> &str {
            self.variant
        }

        fn capabilities(&self) -> &BTreeSet<Capability> {
            &self.capabilities
        }

        fn score(&self, _query: &str, _context: &Context) -> Result<f32, WorkerError> {
            Ok(0.5)
        }

        async fn answer(&self, _query: &str, _call: &CallContext) -> Result<WorkerReply, WorkerError> {
            Ok(WorkerReply::new(self.variant, 0.5))
        }
    }

    fn registry() -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        registry
            .register_worker("physics", || Fixed::new("Physics", &["physics-simulation"]))
            .unwrap();
        registry
            .register_worker("viz", || {
                Fixed::new("Visualization", &["3d-visualization", "physics-simulation"])
            })
            .unwrap();
        registry
            .register_worker("debug", || Fixed::new("Debug", &["error-analysis"]))
            .unwrap();
        registry
    }

    #[test]
    fn test_registration_order_is_stable() {
        let registry = registry();
        assert_eq!(registry.list_names(), vec!["physics", "viz", "debug"]);
        assert_eq!(
            registry.list_by_capability(&Capability::from("physics-simulation")),
            vec!["physics", "viz"]
        );

        // Re-registering keeps position and leaves exactly one entry
        let replaced = registry
            .register_worker("physics", || Fixed::new("Physics2", &["physics-simulation"]))
            .unwrap();
        assert!(replaced);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.list_names(), vec!["physics", "viz", "debug"]);
        let info = registry.info("physics").unwrap();
        assert_eq!(info.variant, "Physics2");
        assert_eq!(info.generation, 2);
    }

    #[test]
    fn test_unknown_worker() {
        let registry = registry();
        assert_eq!(
            registry.get_or_create("nope", "s1").err(),
            Some(RegistryError::UnknownWorker("nope".into()))
        );
        assert!(matches!(
            registry.register_worker("", || Fixed::new("X", &[])),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_instances_are_per_session() {
        let registry = registry();
        let a1 = registry.get_or_create("physics", "a").unwrap();
        let a2 = registry.get_or_create("physics", "a").unwrap();
        let b = registry.get_or_create("physics", "b").unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(registry.instance_count(), 2);

        assert_eq!(registry.release_session("a"), 1);
        assert_eq!(registry.instance_count(), 1);
    }

    #[test]
    fn test_reregister_keeps_existing_instances() {
        let registry = registry();
        let before = registry.get_or_create("physics", "a").unwrap();
        registry
            .register_worker("physics", || Fixed::new("Physics2", &["physics-simulation"]))
            .unwrap();
        let after = registry.get_or_create("physics", "a").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(registry.instance_count(), 1);

        let fresh = registry.get_or_create("physics", "b").unwrap();
        assert_eq!(fresh.variant(), "Physics2");
    }

    #[test]
    fn test_capability_index() {
        let registry = registry();
        let caps = registry.list_capabilities();
        assert_eq!(caps[&Capability::from("physics-simulation")], vec!["physics", "viz"]);
        assert_eq!(caps[&Capability::from("error-analysis")], vec!["debug"]);
        assert!(registry.unregister("viz"));
        assert!(!registry
            .list_capabilities()
            .contains_key(&Capability::from("3d-visualization")));
    }

    #[test]
    fn test_health_tracking() {
        let registry = registry();
        registry.record_success("physics", 100);
        registry.record_success("physics", 200);
        registry.record_failure("physics", &FailureKind::Timeout { after_ms: 2000 });
        let health = registry.info("physics").unwrap().health;
        assert_eq!(health.avg_latency_ms, 150);
        assert_eq!(health.timeout_count, 1);
        assert!((health.success_rate() - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(health.last_error.as_deref(), Some("timed out after 2000ms"));
    }
}
