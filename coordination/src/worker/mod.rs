//! Worker contract: capabilities, confidence scoring and answering.
//!
//! Every assistant variant implements [`Worker`]. The coordinator only ever
//! talks to workers through this trait; variants are selected by registered
//! name, never by probing the concrete type.
//!
//! ```text
//! score(query, context)  ──▶  f32 in [0,1]      (pure, synchronous)
//! answer(query, call)    ──▶  WorkerReply        (async, deadline-bound)
//!                              │
//!                              ▼  (coordinator stamps id, variant, latency)
//!                         WorkerResponse
//! ```

pub mod scoring;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::session::Context;

pub use scoring::{KeywordProfile, KeywordProfileBuilder, ScoreBreakdown, ScoringWeights};

/// Registered worker name (e.g. "physics").
pub type WorkerId = String;

/// Shared handle to a worker instance.
pub type SharedWorker = Arc<dyn Worker>;

/// Capability tags understood by the builtin variants.
pub mod tags {
    pub const PHYSICS_SIMULATION: &str = "physics-simulation";
    pub const VISUALIZATION_3D: &str = "3d-visualization";
    pub const PERFORMANCE_TUNING: &str = "performance-tuning";
    pub const ERROR_ANALYSIS: &str = "error-analysis";
}

/// An opaque expertise tag declared by a worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Capability {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

/// Error raised by a worker while scoring or answering.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Scoring failed: {0}")]
    Scoring(String),

    #[error("Execution failed: {0}")]
    Execution(String),
}

/// What a worker produces for one call, before the coordinator stamps it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerReply {
    /// Free-text answer
    pub answer: String,
    /// Self-assessed relevance in [0,1]
    pub confidence: f32,
    /// Ordered code suggestions
    #[serde(default)]
    pub code_suggestions: Vec<String>,
    /// Optional longer explanation
    #[serde(default)]
    pub explanation: Option<String>,
    /// Capabilities actually exercised to produce this reply
    #[serde(default)]
    pub capabilities_used: Vec<Capability>,
    /// Named numeric recommendations (e.g. `timestep = 0.004`)
    #[serde(default)]
    pub recommended_parameters: BTreeMap<String, f64>,
    /// Symptom this reply claims to definitively fix, if any
    #[serde(default)]
    pub definitive_fix_for: Option<String>,
}

impl WorkerReply {
    pub fn new(answer: impl Into<String>, confidence: f32) -> Self {
        Self {
            answer: answer.into(),
            confidence,
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code_suggestions.push(code.into());
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        let capability = capability.into();
        if !self.capabilities_used.contains(&capability) {
            self.capabilities_used.push(capability);
        }
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.recommended_parameters.insert(name.into(), value);
        self
    }

    pub fn claiming_fix_for(mut self, symptom: impl Into<String>) -> Self {
        self.definitive_fix_for = Some(symptom.into());
        self
    }
}

/// A validated worker answer as it appears in a coordination result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub worker_id: WorkerId,
    pub variant: String,
    pub answer: String,
    /// Always finite and within [0,1]
    pub confidence: f32,
    pub code_suggestions: Vec<String>,
    pub explanation: Option<String>,
    pub capabilities_used: Vec<Capability>,
    pub recommended_parameters: BTreeMap<String, f64>,
    pub definitive_fix_for: Option<String>,
    pub latency_ms: u64,
}

impl WorkerResponse {
    /// Stamp a reply with its origin and latency.
    ///
    /// Rejects replies whose confidence is not a finite number; finite
    /// values are clamped into [0,1].
    pub fn from_reply(
        worker_id: &str,
        variant: &str,
        reply: WorkerReply,
        latency: Duration,
    ) -> Result<Self, WorkerError> {
        let confidence = sanitize_unit(reply.confidence).ok_or_else(|| {
            WorkerError::Execution(format!("non-finite confidence {}", reply.confidence))
        })?;

        Ok(Self {
            worker_id: worker_id.to_string(),
            variant: variant.to_string(),
            answer: reply.answer,
            confidence,
            code_suggestions: reply.code_suggestions,
            explanation: reply.explanation,
            capabilities_used: reply.capabilities_used,
            recommended_parameters: reply.recommended_parameters,
            definitive_fix_for: reply.definitive_fix_for,
            latency_ms: latency.as_millis() as u64,
        })
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

/// Why a worker contributed nothing to a coordination call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// `score()` errored or produced a non-finite value; never dispatched
    Scoring { message: String },
    /// `answer()` errored, panicked or returned an invalid reply
    Execution { message: String },
    /// Per-worker timeout elapsed
    Timeout { after_ms: u64 },
    /// Still running when the overall time budget ran out
    BudgetExhausted { after_ms: u64 },
}

/// Soft failure record for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub worker_id: WorkerId,
    #[serde(flatten)]
    pub kind: FailureKind,
}

impl WorkerFailure {
    pub fn scoring(worker_id: &str, message: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            kind: FailureKind::Scoring {
                message: message.into(),
            },
        }
    }

    pub fn execution(worker_id: &str, message: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            kind: FailureKind::Execution {
                message: message.into(),
            },
        }
    }

    pub fn timeout(worker_id: &str, after: Duration) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            kind: FailureKind::Timeout {
                after_ms: after.as_millis() as u64,
            },
        }
    }

    pub fn budget_exhausted(worker_id: &str, after: Duration) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            kind: FailureKind::BudgetExhausted {
                after_ms: after.as_millis() as u64,
            },
        }
    }

    /// Whether the worker was dispatched before failing.
    pub fn was_dispatched(&self) -> bool {
        !matches!(self.kind, FailureKind::Scoring { .. })
    }
}

/// Key/value scratch space shared by all workers of one call.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad(Arc<Mutex<BTreeMap<String, Value>>>);

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: Value) {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Everything a worker may see or touch during one `answer()` call.
#[derive(Debug, Clone)]
pub struct CallContext {
    context: Arc<Context>,
    scratch: Scratchpad,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(context: Arc<Context>, scratch: Scratchpad) -> Self {
        Self {
            context,
            scratch,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Read-only view of the session context taken at dispatch time.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn scratch(&self) -> &Scratchpad {
        &self.scratch
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the caller gives up on this worker.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// The capability/confidence contract every assistant variant implements.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Variant name, e.g. "Physics"
    fn variant(&self) -> &str;

    /// Capabilities declared at construction; never change afterwards.
    fn capabilities(&self) -> &BTreeSet<Capability>;

    /// Relevance of this worker for `query` in `context`.
    ///
    /// Must be cheap and free of I/O. The coordinator clamps finite values
    /// into [0,1] and treats errors or non-finite values as soft failures.
    fn score(&self, query: &str, context: &Context) -> Result<f32, WorkerError>;

    /// Produce an answer. May only write to the call's scratchpad.
    async fn answer(&self, query: &str, call: &CallContext) -> Result<WorkerReply, WorkerError>;
}

/// Clamp a finite value into [0,1]; `None` for NaN or infinities.
pub fn sanitize_unit(value: f32) -> Option<f32> {
    if value.is_finite() {
        Some(value.clamp(0.0, 1.0))
    } else {
        None
    }
}
