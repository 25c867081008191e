//! Typed message envelopes exchanged within a session.
//!
//! Messages are immutable once built: fields are private and only exposed
//! through getters. Delivery order per session is priority first, then
//! arrival (see [`queue`]).

pub mod queue;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use queue::{Mailbox, MessageQueue, MessageRouter};

/// What a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Query,
    Response,
    Coordination,
    ContextUpdate,
    WorkerStatus,
    Error,
}

impl MessageKind {
    pub fn default_priority(self) -> Priority {
        match self {
            MessageKind::Error => Priority::High,
            MessageKind::WorkerStatus => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Query => "query",
            MessageKind::Response => "response",
            MessageKind::Coordination => "coordination",
            MessageKind::ContextUpdate => "context_update",
            MessageKind::WorkerStatus => "worker_status",
            MessageKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Delivery priority; `Urgent` is delivered first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// An immutable message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: Uuid,
    kind: MessageKind,
    priority: Priority,
    session_id: String,
    payload: Value,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// New message with the kind's default priority.
    pub fn new(kind: MessageKind, session_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority: kind.default_priority(),
            session_id: session_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Same message content at a different priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
