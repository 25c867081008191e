//! Boundary to the external code runner.
//!
//! Only workers hold a runner; the coordinator never executes code.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type for code runner calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("Code runner unavailable: {0}")]
    Unavailable(String),

    #[error("Code runner failed: {0}")]
    Failed(String),

    #[error("Code runner timed out after {0}ms")]
    Timeout(u64),
}

/// Machine-readable error reported by the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Error class, e.g. "FloatingPointError"
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Output of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_error: Option<StructuredError>,
}

impl RunOutput {
    pub fn succeeded(&self) -> bool {
        self.structured_error.is_none() && self.stderr.trim().is_empty()
    }
}

/// Executes a code snippet somewhere outside this process.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, code: &str) -> Result<RunOutput, RunnerError>;
}

pub type SharedCodeRunner = Arc<dyn CodeRunner>;
