//! In-memory session store with per-session single-writer leases.
//!
//! Each session lives in its own slot. The slot mutex is the lease: whoever
//! holds it is the only writer of that session's context. Closing a session
//! cancels its token first, so an in-flight coordination call gives up the
//! lease promptly instead of making `close` wait for the whole budget.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{ContextPatch, NotebookRef, Session, SessionId};

/// Error type for session store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session closed: {0}")]
    Closed(SessionId),

    #[error("Invalid session id: {0:?}")]
    InvalidId(String),
}

struct SessionSlot {
    session: Arc<Mutex<Session>>,
    cancel: CancellationToken,
    last_activity: StdMutex<Instant>,
}

impl SessionSlot {
    fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::new(Mutex::new(session)),
            cancel: CancellationToken::new(),
            last_activity: StdMutex::new(Instant::now()),
        })
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        let last = *self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now().saturating_duration_since(last)
    }
}

/// Exclusive write access to one live session.
///
/// Dropping the lease records activity and lets the next queued caller in.
pub struct SessionLease {
    guard: OwnedMutexGuard<Session>,
    slot: Arc<SessionSlot>,
}

impl SessionLease {
    /// Token cancelled when the session is closed.
    pub fn cancellation(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.slot.touch();
    }
}

/// Registry of sessions keyed by caller-chosen id.
#[derive(Default)]
pub struct SessionStore {
    slots: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Result<Arc<SessionSlot>, SessionError> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Create a session, or return the live one already using `id`.
    ///
    /// A closed session under the same id is replaced by a fresh one.
    pub async fn create(
        &self,
        id: &str,
        notebook_ref: Option<NotebookRef>,
        initial: Option<ContextPatch>,
    ) -> Result<Session, SessionError> {
        if id.trim().is_empty() {
            return Err(SessionError::InvalidId(id.to_string()));
        }

        let (slot, fresh) = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            match slots.get(id).cloned() {
                Some(existing) if !existing.is_closed() => (existing, false),
                previous => {
                    if previous.is_some() {
                        info!(session_id = %id, "Replacing closed session");
                    }
                    let mut session = Session::new(id, notebook_ref);
                    if let Some(patch) = initial {
                        session.context.apply(patch);
                    }
                    let slot = SessionSlot::new(session);
                    slots.insert(id.to_string(), slot.clone());
                    (slot, true)
                }
            }
        };

        if fresh {
            debug!(session_id = %id, "Session created");
        }
        let session = slot.session.lock().await;
        Ok(session.clone())
    }

    /// Acquire the single-writer lease on a live session.
    ///
    /// Waits while another call holds the lease.
    pub async fn lease(&self, id: &str) -> Result<SessionLease, SessionError> {
        let slot = self.slot(id)?;
        if slot.is_closed() {
            return Err(SessionError::Closed(id.to_string()));
        }
        let guard = slot.session.clone().lock_owned().await;
        if guard.is_closed() || slot.is_closed() {
            return Err(SessionError::Closed(id.to_string()));
        }
        Ok(SessionLease { guard, slot })
    }

    /// Copy of the session, closed or not.
    pub async fn snapshot(&self, id: &str) -> Result<Session, SessionError> {
        let slot = self.slot(id)?;
        let session = slot.session.lock().await;
        Ok(session.clone())
    }

    /// Close a session. In-flight work on it is cancelled; closing twice is
    /// a no-op.
    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        let slot = self.slot(id)?;
        slot.cancel.cancel();
        let mut session = slot.session.lock().await;
        if !session.is_closed() {
            session.close();
            info!(session_id = %id, "Session closed");
        }
        drop(session);
        slot.touch();
        Ok(())
    }

    /// Close every live session idle for at least `idle`.
    ///
    /// Sessions whose lease is currently held are skipped.
    pub fn sweep_idle(&self, idle: Duration) -> Vec<SessionId> {
        let candidates: Vec<(SessionId, Arc<SessionSlot>)> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, slot)| !slot.is_closed() && slot.idle_for() >= idle)
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut closed = Vec::new();
        for (id, slot) in candidates {
            let Ok(mut session) = slot.session.try_lock() else {
                debug!(session_id = %id, "Skipping busy session during sweep");
                continue;
            };
            slot.cancel.cancel();
            session.close();
            drop(session);
            slot.touch();
            info!(session_id = %id, "Closed idle session");
            closed.push(id);
        }
        closed.sort();
        closed
    }

    /// Drop closed sessions that have been closed for at least `retention`.
    pub fn purge_closed(&self, retention: Duration) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let before = slots.len();
        slots.retain(|_, slot| !(slot.is_closed() && slot.idle_for() >= retention));
        before - slots.len()
    }

    /// Number of sessions held, closed ones included.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
