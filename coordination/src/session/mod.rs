//! Sessions and their mutable context.
//!
//! ```text
//!   create ──▶ Created ──(first exchange)──▶ Active ──(close / idle sweep)──▶ Closed
//!                                              ▲  │
//!                                              └──┘ context updates (single writer)
//! ```
//!
//! Closed sessions are kept as tombstones so late callers get a
//! `Closed` error instead of a silently recreated session.

pub mod store;
pub mod types;

pub use store::{SessionError, SessionLease, SessionStore};
pub use types::{
    Context, ContextPatch, NotebookRef, Session, SessionId, SessionState, Turn, TurnRole,
};
