//! Upstream conversation-handle cache.
//!
//! The upstream threads messages into server-side conversations via an
//! opaque id it returns in stream events. The cache keeps that id per
//! user so follow-up turns continue the same conversation, and forgets
//! entries after a TTL so abandoned conversations do not pin upstream
//! state forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

const CONVERSATION_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

struct ConversationEntry {
    conversation_id: String,
    stored_at: Instant,
}

/// user_id → conversation id, with TTL expiry.
pub struct ConversationCache {
    entries: RwLock<HashMap<String, ConversationEntry>>,
    ttl: Duration,
}

impl Default for ConversationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationCache {
    pub fn new() -> Self {
        Self::with_ttl(CONVERSATION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<String> {
        let entries = self.entries.read();
        let entry = entries.get(user_id)?;
        if entry.stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.conversation_id.clone())
    }

    pub fn store(&self, user_id: &str, conversation_id: &str) {
        self.entries.write().insert(
            user_id.to_owned(),
            ConversationEntry {
                conversation_id: conversation_id.to_owned(),
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop the cached id for a user (used when the upstream reports the
    /// conversation no longer exists).
    pub fn clear(&self, user_id: &str) {
        self.entries.write().remove(user_id);
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Spawn the hourly TTL sweeper; exits when `shutdown` is cancelled.
pub(crate) fn spawn_sweeper(cache: Arc<ConversationCache>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let dropped = cache.sweep();
                    if dropped > 0 {
                        tracing::debug!(dropped, remaining = cache.len(), "conversation cache swept");
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
}
