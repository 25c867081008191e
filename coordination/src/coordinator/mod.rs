//! The coordination engine.
//!
//! ```text
//!  coordinate(session, request)
//!     │ lease session (single writer)
//!     ▼
//!  Received ─▶ Scoring ─▶ Dispatching ─▶ Collecting ─▶ Reconciling ─▶ Completed
//!                              │              │
//!                              └──────┬───────┘
//!                                     ▼
//!                                  TimedOut  (budget ran out; partial result)
//! ```
//!
//! One [`Coordinator`] owns the session store and message router and shares
//! a [`WorkerRegistry`] with whoever registers workers. There is no global
//! instance.

pub mod dispatch;
pub mod reconcile;
pub mod selection;
pub mod types;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::message::{Mailbox, Message, MessageKind, MessageRouter};
use crate::persistence::{InteractionRecord, SharedSink};
use crate::registry::{SharedRegistry, WorkerInfo};
use crate::session::{
    ContextPatch, NotebookRef, Session, SessionId, SessionLease, SessionState, SessionStore,
    TurnRole,
};
use crate::worker::{
    CallContext, Capability, Scratchpad, WorkerFailure, WorkerResponse,
};

use dispatch::Cancelled;
use reconcile::ReconcilePolicy;
use selection::Candidate;

pub use dispatch::per_worker_timeout;
pub use reconcile::{
    conflict_reasons, consensus_score, detect_conflicts, extract_assignments, Reconciled,
};
pub use types::{
    Conflict, ConflictReason, CoordinationPhase, CoordinationRequest, CoordinationResult,
    RankedWorker,
};

/// Shared reference to Coordinator
pub type SharedCoordinator = Arc<Coordinator>;

/// Routes requests to workers and reconciles their answers.
pub struct Coordinator {
    registry: SharedRegistry,
    sessions: SessionStore,
    router: MessageRouter,
    sink: Option<SharedSink>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(registry: SharedRegistry, config: CoordinatorConfig) -> Self {
        let router = MessageRouter::new(config.mailbox_capacity);
        Self {
            registry,
            sessions: SessionStore::new(),
            router,
            sink: None,
            config,
        }
    }

    /// Attach an interaction sink
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedCoordinator {
        Arc::new(self)
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Mailbox receiving every message produced for `session_id`.
    pub fn subscribe(&self, session_id: &str) -> Mailbox {
        self.router.subscribe(session_id)
    }

    fn emit(&self, lease: &mut SessionLease, message: Message) {
        self.router.publish(&message);
        lease.record(message);
    }

    fn emit_error(&self, lease: &mut SessionLease, err: &CoordinatorError) {
        let message = Message::new(MessageKind::Error, lease.id.clone(), err.to_payload());
        self.emit(lease, message);
    }

    fn policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            min_confidence_floor: self.config.min_confidence_floor,
            conflict_penalty: self.config.conflict_penalty,
            numeric_tolerance: self.config.numeric_tolerance,
        }
    }

    // =========================================================================
    // Session Management
    // =========================================================================

    /// Create a session, or return the live one already using this id.
    pub async fn create_session(
        &self,
        session_id: &str,
        notebook_ref: Option<NotebookRef>,
        initial_context: Option<ContextPatch>,
    ) -> CoordinatorResult<Session> {
        let session = self
            .sessions
            .create(session_id, notebook_ref, initial_context)
            .await?;
        info!(session_id = %session_id, state = %session.state, "Session ready");
        Ok(session)
    }

    /// Close a session, cancelling any in-flight coordination on it.
    pub async fn end_session(&self, session_id: &str) -> CoordinatorResult<()> {
        self.sessions.close(session_id).await?;
        let released = self.registry.release_session(session_id);
        self.router.remove(session_id);
        info!(session_id = %session_id, released, "Session ended");
        Ok(())
    }

    /// Merge a partial context update into the session.
    ///
    /// Returns the new context version.
    pub async fn update_context(&self, session_id: &str, patch: ContextPatch) -> CoordinatorResult<u64> {
        let mut lease = self.sessions.lease(session_id).await?;
        let keys: Vec<String> = patch
            .domain_params
            .keys()
            .chain(patch.resources.keys())
            .cloned()
            .collect();
        let code_changed = patch.code.is_some();
        lease.context.apply(patch);
        lease.activate();
        let version = lease.context.version;

        let message = Message::new(
            MessageKind::ContextUpdate,
            session_id,
            json!({ "version": version, "keys": keys, "code_changed": code_changed }),
        );
        self.emit(&mut lease, message);
        debug!(session_id = %session_id, version, "Context updated");
        Ok(version)
    }

    /// Ordered message history of a session, closed or not.
    pub async fn history(&self, session_id: &str) -> CoordinatorResult<Vec<Message>> {
        Ok(self.sessions.snapshot(session_id).await?.history)
    }

    pub async fn session(&self, session_id: &str) -> CoordinatorResult<Session> {
        Ok(self.sessions.snapshot(session_id).await?)
    }

    pub async fn session_state(&self, session_id: &str) -> CoordinatorResult<SessionState> {
        Ok(self.sessions.snapshot(session_id).await?.state)
    }

    /// Close idle sessions and purge old tombstones. Returns the ids closed.
    pub fn sweep_idle_sessions(&self) -> Vec<SessionId> {
        let closed = self.sessions.sweep_idle(self.config.session_idle_timeout());
        for id in &closed {
            self.registry.release_session(id);
            self.router.remove(id);
        }
        let purged = self
            .sessions
            .purge_closed(self.config.closed_session_retention());
        if !closed.is_empty() || purged > 0 {
            info!(closed = closed.len(), purged, "Idle sweep finished");
        }
        closed
    }

    /// Run [`sweep_idle_sessions`](Self::sweep_idle_sessions) every
    /// `sweep_interval` until the coordinator is dropped.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else {
                    debug!("Coordinator dropped, idle sweeper exiting");
                    break;
                };
                this.sweep_idle_sessions();
            }
        })
    }

    // =========================================================================
    // Worker Catalogue
    // =========================================================================

    /// Registered workers in registration order.
    pub fn list_worker_types(&self) -> Vec<WorkerInfo> {
        self.registry.infos()
    }

    /// Capability → workers declaring it.
    pub fn list_capabilities(&self) -> BTreeMap<Capability, Vec<String>> {
        self.registry.list_capabilities()
    }

    // =========================================================================
    // Coordination
    // =========================================================================

    /// Route `request` to the best workers and reconcile their answers.
    ///
    /// Calls on the same session run one at a time. The time budget starts
    /// when the call is made, so waiting for the session lease uses it up.
    /// Per-worker failures and budget exhaustion produce a partial result,
    /// not an error, as long as at least one worker answered.
    pub async fn coordinate(
        &self,
        session_id: &str,
        request: CoordinationRequest,
    ) -> CoordinatorResult<CoordinationResult> {
        let started = Instant::now();
        let budget = request
            .time_budget_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.default_time_budget())
            .max(Duration::from_millis(1));
        let deadline = started + budget;

        // Queueing behind another call on this session counts against the budget
        let lease = tokio::time::timeout_at(deadline, self.sessions.lease(session_id)).await;
        let mut lease = match lease {
            Ok(lease) => lease?,
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    budget_ms = budget.as_millis() as u64,
                    "Time budget spent waiting for the session"
                );
                return Err(CoordinatorError::NoResponse {
                    failures: Vec::new(),
                });
            }
        };
        let cancel = lease.cancellation();
        debug!(session_id = %session_id, phase = %CoordinationPhase::Received, "Coordination received");

        if let Some(patch) = request.context.clone() {
            lease.context.apply(patch);
        }
        let query_message = Message::new(
            MessageKind::Query,
            session_id,
            json!({
                "query": request.query,
                "required_capabilities": request.required_capabilities,
                "preferred_workers": request.preferred_workers,
            }),
        );
        self.emit(&mut lease, query_message);
        lease
            .context
            .push_turn(TurnRole::User, request.query.clone(), None);

        // ── Scoring ──
        debug!(session_id = %session_id, phase = %CoordinationPhase::Scoring, "Scoring candidates");
        let candidates = match self.candidates(session_id, &request) {
            Ok(c) => c,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "No candidates");
                self.emit_error(&mut lease, &e);
                return Err(e);
            }
        };
        let max_workers = request
            .max_workers
            .unwrap_or(self.config.default_max_workers)
            .max(1);
        let selection = selection::rank(candidates, &request.query, &lease.context, max_workers);
        let mut failures = selection.failures;
        for failure in &failures {
            self.registry.record_failure(&failure.worker_id, &failure.kind);
        }

        if selection.selected.is_empty() {
            let err = CoordinatorError::NoResponse { failures };
            self.emit_error(&mut lease, &err);
            return Err(err);
        }
        let selected_view: Vec<RankedWorker> =
            selection.selected.iter().map(|s| s.ranked()).collect();
        debug!(
            session_id = %session_id,
            selected = ?selected_view.iter().map(|r| r.worker_id.as_str()).collect::<Vec<_>>(),
            passed_over = selection.passed_over,
            "Workers selected"
        );

        // ── Dispatching / Collecting ──
        let per_worker = per_worker_timeout(
            budget,
            selection.selected.len(),
            self.config.per_worker_timeout_ceiling(),
        );
        debug!(
            session_id = %session_id,
            phase = %CoordinationPhase::Dispatching,
            budget_ms = budget.as_millis() as u64,
            queued_ms = started.elapsed().as_millis() as u64,
            "Dispatching"
        );
        for s in &selection.selected {
            self.router.publish(&Message::new(
                MessageKind::WorkerStatus,
                session_id,
                json!({ "worker": s.name, "status": "dispatched", "score": s.score }),
            ));
        }

        let context = Arc::new(lease.context.clone());
        let scratch = Scratchpad::new();
        debug!(session_id = %session_id, phase = %CoordinationPhase::Collecting, "Collecting responses");
        let outcome = match dispatch::dispatch(
            &selection.selected,
            &request.query,
            context,
            scratch.clone(),
            deadline,
            per_worker,
            &cancel,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(Cancelled) => {
                return Err(CoordinatorError::SessionClosed(session_id.to_string()));
            }
        };

        for response in &outcome.responses {
            self.registry.record_success(&response.worker_id, response.latency_ms);
            self.router.publish(&Message::new(
                MessageKind::WorkerStatus,
                session_id,
                json!({ "worker": response.worker_id, "status": "responded", "latency_ms": response.latency_ms }),
            ));
        }
        for failure in &outcome.failures {
            self.registry.record_failure(&failure.worker_id, &failure.kind);
            self.router.publish(&Message::new(
                MessageKind::WorkerStatus,
                session_id,
                json!({ "worker": failure.worker_id, "status": "failed", "failure": failure }),
            ));
        }
        let dispatched_failed = !outcome.failures.is_empty();
        let timed_out = outcome.timed_out;
        failures.extend(outcome.failures);
        if timed_out {
            debug!(session_id = %session_id, phase = %CoordinationPhase::TimedOut, "Budget exhausted, reconciling what arrived");
        }

        // ── Reconciling ──
        debug!(session_id = %session_id, phase = %CoordinationPhase::Reconciling, responses = outcome.responses.len(), "Reconciling");
        let Some(reconciled) = reconcile::reconcile(outcome.responses, &self.policy()) else {
            let err = CoordinatorError::NoResponse { failures };
            warn!(session_id = %session_id, "No worker responded");
            self.emit_error(&mut lease, &err);
            return Err(err);
        };

        let phase = if timed_out {
            CoordinationPhase::TimedOut
        } else {
            CoordinationPhase::Completed
        };
        let result = CoordinationResult {
            session_id: session_id.to_string(),
            primary: reconciled.primary,
            supporting: reconciled.supporting,
            dropped: reconciled.dropped,
            consensus: reconciled.consensus,
            conflicts: reconciled.conflicts,
            failures,
            selected: selected_view,
            elapsed_ms: started.elapsed().as_millis() as u64,
            partial: timed_out || dispatched_failed,
            phase,
        };

        lease.context.merge_scratch(scratch.snapshot());
        lease.context.push_turn(
            TurnRole::Assistant,
            result.primary.answer.clone(),
            Some(&result.primary.worker_id),
        );
        let payload = serde_json::to_value(&result).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize coordination result");
            json!({ "primary": result.primary.worker_id })
        });
        self.emit(
            &mut lease,
            Message::new(MessageKind::Coordination, session_id, payload),
        );
        lease.activate();
        drop(lease);

        info!(
            session_id = %session_id,
            primary = %result.primary.worker_id,
            consensus = result.consensus,
            conflicts = result.conflicts.len(),
            partial = result.partial,
            elapsed_ms = result.elapsed_ms,
            phase = %result.phase,
            "Coordination complete"
        );

        self.persist(session_id, &request.query, &result).await;
        Ok(result)
    }

    fn candidates(
        &self,
        session_id: &str,
        request: &CoordinationRequest,
    ) -> CoordinatorResult<Vec<Candidate>> {
        selection::candidate_names(&self.registry, request)?
            .into_iter()
            .map(|name| {
                let order = self
                    .registry
                    .order_of(&name)
                    .ok_or_else(|| CoordinatorError::UnknownWorker(name.clone()))?;
                let worker = self.registry.get_or_create(&name, session_id)?;
                Ok(Candidate {
                    name,
                    order,
                    worker,
                })
            })
            .collect()
    }

    /// Ask one named worker directly, bypassing selection.
    ///
    /// `overlay` is visible to this call only; the session context is left
    /// untouched apart from scratchpad writes and history.
    pub async fn query_single(
        &self,
        session_id: &str,
        worker_name: &str,
        query: &str,
        overlay: Option<ContextPatch>,
    ) -> CoordinatorResult<WorkerResponse> {
        let mut lease = self.sessions.lease(session_id).await?;
        let cancel = lease.cancellation();
        let worker = match self.registry.get_or_create(worker_name, session_id) {
            Ok(w) => w,
            Err(e) => {
                let err = CoordinatorError::from(e);
                self.emit_error(&mut lease, &err);
                return Err(err);
            }
        };

        self.emit(
            &mut lease,
            Message::new(
                MessageKind::Query,
                session_id,
                json!({ "query": query, "worker": worker_name }),
            ),
        );

        let mut view = lease.context.clone();
        if let Some(patch) = overlay {
            view.apply(patch);
        }
        view.push_turn(TurnRole::User, query, None);

        let timeout = self.config.per_worker_timeout_ceiling();
        let scratch = Scratchpad::new();
        let call = CallContext::new(Arc::new(view), scratch.clone())
            .with_deadline(Instant::now() + timeout);
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(CoordinatorError::SessionClosed(session_id.to_string()));
            }
            outcome = tokio::time::timeout(timeout, worker.answer(query, &call)) => outcome,
        };
        let latency = started.elapsed();

        let response = match outcome {
            Ok(Ok(reply)) => WorkerResponse::from_reply(worker_name, worker.variant(), reply, latency)
                .map_err(|e| CoordinatorError::WorkerExecution {
                    worker: worker_name.to_string(),
                    message: e.to_string(),
                }),
            Ok(Err(e)) => Err(CoordinatorError::WorkerExecution {
                worker: worker_name.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(CoordinatorError::WorkerTimeout {
                worker: worker_name.to_string(),
                after_ms: timeout.as_millis() as u64,
            }),
        };

        let response = match response {
            Ok(r) => r,
            Err(err) => {
                let failure = match &err {
                    CoordinatorError::WorkerTimeout { .. } => WorkerFailure::timeout(worker_name, timeout),
                    other => WorkerFailure::execution(worker_name, other.to_string()),
                };
                self.registry.record_failure(worker_name, &failure.kind);
                warn!(session_id = %session_id, worker = %worker_name, error = %err, "Single query failed");
                self.emit_error(&mut lease, &err);
                return Err(err);
            }
        };

        self.registry.record_success(worker_name, response.latency_ms);
        lease.context.merge_scratch(scratch.snapshot());
        lease.context.push_turn(TurnRole::User, query, None);
        lease
            .context
            .push_turn(TurnRole::Assistant, response.answer.clone(), Some(worker_name));
        let payload = serde_json::to_value(&response).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize worker response");
            json!({ "worker": worker_name })
        });
        self.emit(
            &mut lease,
            Message::new(MessageKind::Response, session_id, payload),
        );
        lease.activate();
        drop(lease);

        info!(
            session_id = %session_id,
            worker = %worker_name,
            confidence = response.confidence,
            latency_ms = response.latency_ms,
            "Single query complete"
        );

        if let Some(sink) = &self.sink {
            let record = interaction_record(session_id, query, &response, true);
            if let Err(e) = sink.record(&[record]).await {
                warn!(session_id = %session_id, error = %e, "Failed to persist interaction");
            }
        }
        Ok(response)
    }

    async fn persist(&self, session_id: &str, query: &str, result: &CoordinationResult) {
        let Some(sink) = &self.sink else {
            return;
        };
        let records: Vec<InteractionRecord> = result
            .responses()
            .chain(result.dropped.iter())
            .map(|r| interaction_record(session_id, query, r, r.worker_id == result.primary.worker_id))
            .collect();
        if let Err(e) = sink.record(&records).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist interactions");
        }
    }
}

fn interaction_record(
    session_id: &str,
    query: &str,
    response: &WorkerResponse,
    primary: bool,
) -> InteractionRecord {
    InteractionRecord {
        session_id: session_id.to_string(),
        query: query.to_string(),
        worker_id: response.worker_id.clone(),
        variant: response.variant.clone(),
        response: response.answer.clone(),
        confidence: response.confidence,
        latency_ms: response.latency_ms,
        primary,
        recorded_at: Utc::now(),
    }
}
