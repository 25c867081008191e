//! Caller-facing error taxonomy.
//!
//! Only fatal conditions become a [`CoordinatorError`]. Per-worker
//! timeouts and execution failures inside `coordinate` are reported as
//! [`WorkerFailure`] data on the result instead.

use serde::Serialize;

use crate::registry::RegistryError;
use crate::session::SessionError;
use crate::worker::{Capability, WorkerFailure};

/// Error type for coordinator operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("No registered worker offers any of {}", format_capabilities(.required))]
    NoCapableAgent { required: Vec<Capability> },

    #[error("Worker {worker} timed out after {after_ms}ms")]
    WorkerTimeout { worker: String, after_ms: u64 },

    #[error("Worker {worker} failed: {message}")]
    WorkerExecution { worker: String, message: String },

    #[error("No worker produced a response ({} failed)", .failures.len())]
    NoResponse { failures: Vec<WorkerFailure> },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

fn format_capabilities(required: &[Capability]) -> String {
    if required.is_empty() {
        return "any capability".to_string();
    }
    let names: Vec<&str> = required.iter().map(Capability::as_str).collect();
    format!("[{}]", names.join(", "))
}

impl CoordinatorError {
    /// Stable machine-readable code for transports and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::UnknownWorker(_) => "unknown_worker",
            CoordinatorError::NoCapableAgent { .. } => "no_capable_agent",
            CoordinatorError::WorkerTimeout { .. } => "worker_timeout",
            CoordinatorError::WorkerExecution { .. } => "worker_execution",
            CoordinatorError::NoResponse { .. } => "no_response",
            CoordinatorError::SessionNotFound(_) => "session_not_found",
            CoordinatorError::SessionClosed(_) => "session_closed",
            CoordinatorError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// JSON payload used for `Error` messages.
    pub fn to_payload(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct Payload<'a> {
            code: &'a str,
            message: String,
        }
        serde_json::to_value(Payload {
            code: self.code(),
            message: self.to_string(),
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

impl From<RegistryError> for CoordinatorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWorker(name) => CoordinatorError::UnknownWorker(name),
            RegistryError::InvalidName(name) => {
                CoordinatorError::InvalidRequest(format!("invalid worker name {name:?}"))
            }
        }
    }
}

impl From<SessionError> for CoordinatorError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => CoordinatorError::SessionNotFound(id),
            SessionError::Closed(id) => CoordinatorError::SessionClosed(id),
            SessionError::InvalidId(id) => {
                CoordinatorError::InvalidRequest(format!("invalid session id {id:?}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_keep_kind() {
        let err: CoordinatorError = RegistryError::UnknownWorker("quantum".into()).into();
        assert_eq!(err.code(), "unknown_worker");

        let err: CoordinatorError = SessionError::Closed("s1".into()).into();
        assert_eq!(err, CoordinatorError::SessionClosed("s1".into()));
    }

    #[test]
    fn test_messages() {
        let err = CoordinatorError::NoCapableAgent {
            required: vec![Capability::from("nonexistent-capability")],
        };
        assert_eq!(
            err.to_string(),
            "No registered worker offers any of [nonexistent-capability]"
        );
        let payload = err.to_payload();
        assert_eq!(payload["code"], "no_capable_agent");
    }
}
