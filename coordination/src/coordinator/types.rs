//! Request and result types for coordination calls.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::ContextPatch;
use crate::worker::{Capability, WorkerFailure, WorkerId, WorkerResponse};

/// One question for the coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinationRequest {
    pub query: String,
    /// Empty means any capability
    #[serde(default)]
    pub required_capabilities: BTreeSet<Capability>,
    /// Always considered, whatever their capabilities
    #[serde(default)]
    pub preferred_workers: Vec<WorkerId>,
    /// Falls back to the configured default
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Falls back to the configured default
    #[serde(default)]
    pub time_budget_ms: Option<u64>,
    /// Applied to the session context before scoring
    #[serde(default)]
    pub context: Option<ContextPatch>,
}

impl CoordinationRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn require(mut self, capability: impl Into<Capability>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    pub fn prefer(mut self, worker: impl Into<WorkerId>) -> Self {
        self.preferred_workers.push(worker.into());
        self
    }

    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.time_budget_ms = Some(budget.as_millis() as u64);
        self
    }

    pub fn with_context(mut self, patch: ContextPatch) -> Self {
        self.context = Some(patch);
        self
    }
}

/// Progress of one coordination call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationPhase {
    Received,
    Scoring,
    Dispatching,
    Collecting,
    Reconciling,
    Completed,
    /// Overall budget ran out while workers were still running
    TimedOut,
}

impl fmt::Display for CoordinationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoordinationPhase::Received => "received",
            CoordinationPhase::Scoring => "scoring",
            CoordinationPhase::Dispatching => "dispatching",
            CoordinationPhase::Collecting => "collecting",
            CoordinationPhase::Reconciling => "reconciling",
            CoordinationPhase::Completed => "completed",
            CoordinationPhase::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Why two responses contradict each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictReason {
    /// Same parameter, values further apart than the tolerance
    ParameterMismatch {
        parameter: String,
        left: f64,
        right: f64,
    },
    /// Both claim to definitively fix the symptom, with different code
    CompetingFix { symptom: String },
}

/// A contradictory pair, reported once with `left` ranked before `right`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub left: WorkerId,
    pub right: WorkerId,
    pub reasons: Vec<ConflictReason>,
}

impl Conflict {
    pub fn involves(&self, worker: &str) -> bool {
        self.left == worker || self.right == worker
    }
}

/// A selected worker and the score that got it there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedWorker {
    pub worker_id: WorkerId,
    pub score: f32,
}

/// Reconciled outcome of one coordination call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationResult {
    pub session_id: String,
    pub primary: WorkerResponse,
    /// Highest confidence first
    pub supporting: Vec<WorkerResponse>,
    /// Collected but below the confidence floor
    pub dropped: Vec<WorkerResponse>,
    /// Always within [0,1]
    pub consensus: f32,
    pub conflicts: Vec<Conflict>,
    /// Soft failures, including candidates that failed to score
    pub failures: Vec<WorkerFailure>,
    /// Selected workers in rank order
    pub selected: Vec<RankedWorker>,
    pub elapsed_ms: u64,
    /// Some selected worker failed or the budget ran out
    pub partial: bool,
    /// `Completed` or `TimedOut`
    pub phase: CoordinationPhase,
}

impl CoordinationResult {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Every usable response, primary first.
    pub fn responses(&self) -> impl Iterator<Item = &WorkerResponse> {
        std::iter::once(&self.primary).chain(self.supporting.iter())
    }

    pub fn failed_workers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.worker_id.as_str()).collect()
    }
}
