//! Per-session single-flight gate.
//!
//! At most one turn runs per session. Unlike a queueing lock, a second
//! message for a busy session is rejected immediately so the user gets a
//! "still processing" reply instead of a silent stall.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

pub struct SessionGate {
    active: Arc<RwLock<HashSet<String>>>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    pub fn new() -> Self {
        Self {
            active: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Try to claim the session. `None` means a turn is already running.
    /// The returned guard releases the session on drop.
    pub fn try_acquire(&self, session_id: &str) -> Option<SessionGuard> {
        let mut active = self.active.write();
        if !active.insert(session_id.to_owned()) {
            return None;
        }
        Some(SessionGuard {
            active: self.active.clone(),
            session_id: session_id.to_owned(),
        })
    }

    /// Whether a turn is currently running for the session.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.read().contains(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }
}

/// RAII claim on a session; dropping it re-opens the gate.
pub struct SessionGuard {
    active: Arc<RwLock<HashSet<String>>>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active.write().remove(&self.session_id);
    }
}
