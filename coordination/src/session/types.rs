//! Session and context types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// Caller-chosen session identifier
pub type SessionId = String;

/// Reference to a notebook (and optionally a cell) owned by the editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotebookRef {
    pub notebook_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
}

impl NotebookRef {
    pub fn new(notebook_id: impl Into<String>) -> Self {
        Self {
            notebook_id: notebook_id.into(),
            cell_id: None,
        }
    }

    pub fn with_cell(mut self, cell_id: impl Into<String>) -> Self {
        self.cell_id = Some(cell_id.into());
        self
    }
}

/// Who spoke in a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    /// Worker that produced an assistant turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Mutable per-session state handed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub session_id: SessionId,
    pub notebook_ref: Option<NotebookRef>,
    /// Code snippet currently under discussion
    pub code: Option<String>,
    /// Open domain settings (e.g. `timestep`, `gravity`)
    pub domain_params: BTreeMap<String, Value>,
    /// Resource descriptors (e.g. available devices)
    pub resources: BTreeMap<String, Value>,
    /// Append-only conversation history
    pub history: Vec<Turn>,
    /// Values written by workers through the call scratchpad
    pub scratch: BTreeMap<String, Value>,
    /// Bumped on every mutation
    pub version: u64,
}

impl Context {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            notebook_ref: None,
            code: None,
            domain_params: BTreeMap::new(),
            resources: BTreeMap::new(),
            history: Vec::new(),
            scratch: BTreeMap::new(),
            version: 0,
        }
    }

    /// Apply a partial update. Map entries are merged key by key with the
    /// patch winning; a JSON `null` value removes the key.
    pub fn apply(&mut self, patch: ContextPatch) {
        if let Some(notebook_ref) = patch.notebook_ref {
            self.notebook_ref = Some(notebook_ref);
        }
        if let Some(code) = patch.code {
            self.code = if code.is_empty() { None } else { Some(code) };
        }
        merge_map(&mut self.domain_params, patch.domain_params);
        merge_map(&mut self.resources, patch.resources);
        merge_map(&mut self.scratch, patch.scratch);
        self.version += 1;
    }

    /// Fold scratchpad writes from a finished call into the context.
    pub fn merge_scratch(&mut self, scratch: BTreeMap<String, Value>) {
        if scratch.is_empty() {
            return;
        }
        merge_map(&mut self.scratch, scratch);
        self.version += 1;
    }

    pub fn push_turn(&mut self, role: TurnRole, content: impl Into<String>, worker_id: Option<&str>) {
        self.history.push(Turn {
            role,
            content: content.into(),
            worker_id: worker_id.map(str::to_string),
            timestamp: Utc::now(),
        });
        self.version += 1;
    }

    /// Numeric domain parameter, accepting numbers or numeric strings.
    pub fn domain_f64(&self, key: &str) -> Option<f64> {
        match self.domain_params.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

fn merge_map(target: &mut BTreeMap<String, Value>, updates: BTreeMap<String, Value>) {
    for (key, value) in updates {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

/// Partial context update; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPatch {
    pub notebook_ref: Option<NotebookRef>,
    /// Replaces the code snippet; an empty string clears it
    pub code: Option<String>,
    pub domain_params: BTreeMap<String, Value>,
    pub resources: BTreeMap<String, Value>,
    pub scratch: BTreeMap<String, Value>,
}

impl ContextPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn notebook(mut self, notebook_ref: NotebookRef) -> Self {
        self.notebook_ref = Some(notebook_ref);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.domain_params.insert(key.into(), value.into());
        self
    }

    pub fn resource(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.notebook_ref.is_none()
            && self.code.is_none()
            && self.domain_params.is_empty()
            && self.resources.is_empty()
            && self.scratch.is_empty()
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Active,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// A caller-scoped conversation: one context, one message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub context: Context,
    /// Append-only message history
    pub history: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, notebook_ref: Option<NotebookRef>) -> Self {
        let id = id.into();
        let now = Utc::now();
        let mut context = Context::new(id.clone());
        context.notebook_ref = notebook_ref;
        Self {
            id,
            state: SessionState::Created,
            context,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    /// Touch the session to update last activity
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Created → Active after a successful exchange
    pub fn activate(&mut self) {
        if self.state == SessionState::Created {
            self.state = SessionState::Active;
        }
        self.touch();
    }

    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.closed_at = Some(Utc::now());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub fn record(&mut self, message: Message) {
        self.history.push(message);
        self.touch();
    }
}
