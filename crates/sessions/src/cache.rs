//! The session cache proper: per-session conversation history plus the
//! counters and indexes that keep it bounded.
//!
//! Locking policy: every mutating operation takes the exclusive lock;
//! read-only queries take the shared lock. The two global counters are
//! atomics so `get_stats` can read them without contending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use cf_domain::error::{Error, Result};
use cf_domain::message::{Message, SessionMode};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Sessions idle longer than this are swept.
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(12 * 60 * 60);
pub const MAX_SESSIONS_PER_USER: usize = 10;
pub const MAX_TOTAL_SESSIONS: usize = 10_000;
pub const MAX_MESSAGES_PER_SESSION: usize = 100;
/// Total serialized history size allowed across all live sessions.
pub const MEMORY_LIMIT: i64 = 4 * 1024 * 1024 * 1024;

const DEFAULT_PIC_RESOLUTION: &str = "512x512";

/// Cache bounds, overridable for tests.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    pub max_sessions_per_user: usize,
    pub max_total_sessions: usize,
    pub max_messages_per_session: usize,
    pub memory_limit: i64,
    pub expiration: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_sessions_per_user: MAX_SESSIONS_PER_USER,
            max_total_sessions: MAX_TOTAL_SESSIONS,
            max_messages_per_session: MAX_MESSAGES_PER_SESSION,
            memory_limit: MEMORY_LIMIT,
            expiration: DEFAULT_EXPIRATION,
        }
    }
}

impl CacheLimits {
    /// 90% of the memory limit: forced cleanup keeps evicting until the
    /// total is back under this mark.
    pub fn cleanup_mark(&self) -> i64 {
        self.memory_limit / 10 * 9
    }

    /// 80% of the memory limit: the background monitor warns and triggers
    /// a forced cleanup above this mark.
    pub fn warn_mark(&self) -> i64 {
        self.memory_limit / 10 * 8
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionMeta
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the cache tracks for one session.
///
/// Holds only string identifiers for external objects (card, inbound
/// message, upstream conversation) — never handles back into the card pool
/// or the streaming adapter.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMeta {
    pub mode: SessionMode,
    pub messages: Vec<Message>,
    pub user_id: String,
    pub updated_at: DateTime<Utc>,
    pub message_num: usize,
    /// JSON-serialized size of `messages`, in bytes.
    pub size_bytes: i64,
    pub pic_resolution: String,
    pub card_id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub cache_address: String,
}

impl SessionMeta {
    fn empty(user_id: &str) -> Self {
        Self {
            mode: SessionMode::default(),
            messages: Vec::new(),
            user_id: user_id.to_owned(),
            updated_at: Utc::now(),
            message_num: 0,
            size_bytes: 0,
            pic_resolution: String::new(),
            card_id: String::new(),
            message_id: String::new(),
            conversation_id: String::new(),
            cache_address: String::new(),
        }
    }
}

/// Snapshot returned by [`SessionCache::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_sessions: i64,
    pub total_memory_used_mb: f64,
    pub active_users: usize,
    pub avg_session_size: f64,
    pub last_cleanup_time: Option<DateTime<Utc>>,
    pub cleaned_sessions: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionCache
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    /// Primary owner of every SessionMeta.
    sessions: HashMap<String, SessionMeta>,
    /// user_id → number of sessions owned.
    user_session_count: HashMap<String, usize>,
    /// Weak dedup index: user_id → inbound message_id → session_id.
    /// Entries are purged whenever their primary session is removed.
    user_message_index: HashMap<String, HashMap<String, String>>,
    last_cleanup_time: Option<DateTime<Utc>>,
    cleaned_sessions: usize,
}

pub struct SessionCache {
    inner: RwLock<Inner>,
    limits: CacheLimits,
    total_sessions: AtomicI64,
    total_memory_used: AtomicI64,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self::with_limits(CacheLimits::default())
    }

    pub fn with_limits(limits: CacheLimits) -> Self {
        Self {
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                user_session_count: HashMap::new(),
                user_message_index: HashMap::new(),
                last_cleanup_time: None,
                cleaned_sessions: 0,
            }),
            limits,
            total_sessions: AtomicI64::new(0),
            total_memory_used: AtomicI64::new(0),
        }
    }

    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    /// Current total serialized size across live sessions, in bytes.
    pub fn memory_used(&self) -> i64 {
        self.total_memory_used.load(Ordering::Acquire)
    }

    // ── History ─────────────────────────────────────────────────────

    /// Return a copy of the session's history with `session_id` stamped
    /// into each message's metadata. Empty when the session is unknown.
    pub fn get_messages(&self, session_id: &str) -> Vec<Message> {
        let inner = self.inner.read();
        let Some(meta) = inner.sessions.get(session_id) else {
            return Vec::new();
        };
        meta.messages
            .iter()
            .cloned()
            .map(|mut msg| {
                msg.metadata
                    .insert("session_id".to_owned(), session_id.to_owned());
                msg
            })
            .collect()
    }

    /// Replace the session's history, creating the session if needed.
    ///
    /// Checks run in a fixed order, each with its own error kind: inbound
    /// dedup, per-message validity, message count, per-user session cap
    /// (evicts that user's oldest instead of rejecting), memory bound,
    /// global session bound. On success all counters and the dedup index
    /// are updated under the same exclusive lock.
    #[allow(clippy::too_many_arguments)]
    pub fn set_messages(
        &self,
        session_id: &str,
        user_id: &str,
        messages: Vec<Message>,
        card_id: &str,
        message_id: &str,
        conversation_id: &str,
        cache_address: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write();

        if Self::is_duplicate_locked(&inner, user_id, message_id) {
            return Err(Error::DuplicateMessage);
        }

        for msg in &messages {
            msg.validate()?;
        }

        if messages.len() > self.limits.max_messages_per_session {
            return Err(Error::TooManyMessages {
                count: messages.len(),
                max: self.limits.max_messages_per_session,
            });
        }

        // Per-user cap: a new session for a full user evicts that user's
        // oldest session rather than failing.
        let is_new = !inner.sessions.contains_key(session_id);
        if is_new
            && inner.user_session_count.get(user_id).copied().unwrap_or(0)
                >= self.limits.max_sessions_per_user
        {
            self.evict_oldest_for_user(&mut inner, user_id);
        }

        // Memory bound, against the delta this write would add.
        let new_size = serde_json::to_vec(&messages).map(|b| b.len() as i64)?;
        let mut old_size = inner
            .sessions
            .get(session_id)
            .map(|m| m.size_bytes)
            .unwrap_or(0);
        if self.memory_used() + (new_size - old_size) > self.limits.memory_limit {
            self.force_cleanup_locked(&mut inner);
            // The cleanup may have evicted this very session.
            old_size = inner
                .sessions
                .get(session_id)
                .map(|m| m.size_bytes)
                .unwrap_or(0);
            if self.memory_used() + (new_size - old_size) > self.limits.memory_limit {
                return Err(Error::MemoryExceeded);
            }
        }

        // Global session bound, only relevant when inserting.
        let is_new = !inner.sessions.contains_key(session_id);
        if is_new
            && self.total_sessions.load(Ordering::Acquire) >= self.limits.max_total_sessions as i64
        {
            self.force_cleanup_locked(&mut inner);
            if self.total_sessions.load(Ordering::Acquire)
                >= self.limits.max_total_sessions as i64
            {
                return Err(Error::MaxSessionsExceeded);
            }
        }

        let now = Utc::now();
        let message_num = messages.len();
        if inner.sessions.contains_key(session_id) {
            let adopts_owner = {
                let meta = inner.sessions.get_mut(session_id).expect("checked above");
                self.total_memory_used
                    .fetch_sub(meta.size_bytes, Ordering::AcqRel);
                meta.messages = messages;
                meta.updated_at = now;
                meta.message_num = message_num;
                meta.size_bytes = new_size;
                meta.card_id = card_id.to_owned();
                meta.message_id = message_id.to_owned();
                meta.conversation_id = conversation_id.to_owned();
                meta.cache_address = cache_address.to_owned();
                // A placeholder created by set_mode has no owner yet.
                let adopts = meta.user_id.is_empty() && !user_id.is_empty();
                if adopts {
                    meta.user_id = user_id.to_owned();
                }
                adopts
            };
            if adopts_owner {
                *inner
                    .user_session_count
                    .entry(user_id.to_owned())
                    .or_insert(0) += 1;
            }
        } else {
            let meta = SessionMeta {
                mode: SessionMode::default(),
                messages,
                user_id: user_id.to_owned(),
                updated_at: now,
                message_num,
                size_bytes: new_size,
                pic_resolution: String::new(),
                card_id: card_id.to_owned(),
                message_id: message_id.to_owned(),
                conversation_id: conversation_id.to_owned(),
                cache_address: cache_address.to_owned(),
            };
            inner.sessions.insert(session_id.to_owned(), meta);
            self.total_sessions.fetch_add(1, Ordering::AcqRel);
            *inner
                .user_session_count
                .entry(user_id.to_owned())
                .or_insert(0) += 1;
        }
        self.total_memory_used.fetch_add(new_size, Ordering::AcqRel);

        inner
            .user_message_index
            .entry(user_id.to_owned())
            .or_default()
            .insert(message_id.to_owned(), session_id.to_owned());

        Ok(())
    }

    // ── Removal ─────────────────────────────────────────────────────

    /// Remove one session, its counters, and its dedup-index entry.
    pub fn clear(&self, session_id: &str) {
        let mut inner = self.inner.write();
        self.remove_session_locked(&mut inner, session_id);
    }

    /// Remove every session owned by a user.
    pub fn clear_user_sessions(&self, user_id: &str) {
        let mut inner = self.inner.write();
        let owned: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, meta)| meta.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in owned {
            self.remove_session_locked(&mut inner, &session_id);
        }
    }

    /// Sweep sessions idle past the TTL. Returns how many were removed.
    pub fn clean_expired_sessions(&self) -> usize {
        let mut inner = self.inner.write();
        let count = self.clean_expired_locked(&mut inner);
        inner.last_cleanup_time = Some(Utc::now());
        inner.cleaned_sessions += count;
        count
    }

    /// TTL sweep, then — if still above the 90% memory mark — evict the
    /// oldest 20% of sessions by `updated_at`.
    pub fn force_cleanup(&self) {
        let mut inner = self.inner.write();
        self.force_cleanup_locked(&mut inner);
    }

    // ── Session attributes ──────────────────────────────────────────

    pub fn get_mode(&self, session_id: &str) -> SessionMode {
        self.inner
            .read()
            .sessions
            .get(session_id)
            .map(|m| m.mode)
            .unwrap_or_default()
    }

    /// Set the session mode, creating an unowned placeholder session when
    /// the id is unknown (a card action can arrive before any chat turn).
    pub fn set_mode(&self, session_id: &str, mode: SessionMode) {
        let mut inner = self.inner.write();
        let meta = self.ensure_session_locked(&mut inner, session_id);
        meta.mode = mode;
        meta.updated_at = Utc::now();
    }

    pub fn get_pic_resolution(&self, session_id: &str) -> String {
        let inner = self.inner.read();
        match inner.sessions.get(session_id) {
            Some(meta) if !meta.pic_resolution.is_empty() => meta.pic_resolution.clone(),
            _ => DEFAULT_PIC_RESOLUTION.to_owned(),
        }
    }

    pub fn set_pic_resolution(&self, session_id: &str, resolution: &str) {
        let mut inner = self.inner.write();
        let meta = self.ensure_session_locked(&mut inner, session_id);
        meta.pic_resolution = resolution.to_owned();
        meta.updated_at = Utc::now();
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Read-only dedup probe; does not mutate the index.
    pub fn is_duplicate_message(&self, user_id: &str, message_id: &str) -> bool {
        Self::is_duplicate_locked(&self.inner.read(), user_id, message_id)
    }

    /// Look up the session that an inbound (user, message) pair belongs
    /// to, via the dedup index first, then a full scan as fallback.
    pub fn get_session_info(&self, user_id: &str, message_id: &str) -> Option<SessionMeta> {
        let inner = self.inner.read();
        if let Some(session_id) = inner
            .user_message_index
            .get(user_id)
            .and_then(|msgs| msgs.get(message_id))
        {
            if let Some(meta) = inner.sessions.get(session_id) {
                return Some(meta.clone());
            }
        }
        inner
            .sessions
            .values()
            .find(|meta| meta.user_id == user_id && meta.message_id == message_id)
            .cloned()
    }

    pub fn get_session_meta(&self, session_id: &str) -> Option<SessionMeta> {
        self.inner.read().sessions.get(session_id).cloned()
    }

    pub fn get_user_sessions(&self, user_id: &str) -> Vec<String> {
        self.inner
            .read()
            .sessions
            .iter()
            .filter(|(_, meta)| meta.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn get_stats(&self) -> SessionStats {
        let inner = self.inner.read();
        let total_sessions = self.total_sessions.load(Ordering::Acquire);
        let memory = self.total_memory_used.load(Ordering::Acquire);
        SessionStats {
            total_sessions,
            total_memory_used_mb: memory as f64 / 1024.0 / 1024.0,
            active_users: inner.user_session_count.len(),
            avg_session_size: if total_sessions > 0 {
                memory as f64 / total_sessions as f64
            } else {
                0.0
            },
            last_cleanup_time: inner.last_cleanup_time,
            cleaned_sessions: inner.cleaned_sessions,
        }
    }

    // ── Internals (callers hold the write lock) ─────────────────────

    fn is_duplicate_locked(inner: &Inner, user_id: &str, message_id: &str) -> bool {
        inner
            .user_message_index
            .get(user_id)
            .is_some_and(|msgs| msgs.contains_key(message_id))
    }

    fn ensure_session_locked<'a>(
        &self,
        inner: &'a mut Inner,
        session_id: &str,
    ) -> &'a mut SessionMeta {
        if !inner.sessions.contains_key(session_id) {
            inner
                .sessions
                .insert(session_id.to_owned(), SessionMeta::empty(""));
            self.total_sessions.fetch_add(1, Ordering::AcqRel);
        }
        inner.sessions.get_mut(session_id).expect("just inserted")
    }

    fn remove_session_locked(&self, inner: &mut Inner, session_id: &str) {
        let Some(meta) = inner.sessions.remove(session_id) else {
            return;
        };
        self.total_memory_used
            .fetch_sub(meta.size_bytes, Ordering::AcqRel);
        self.total_sessions.fetch_sub(1, Ordering::AcqRel);

        if !meta.user_id.is_empty() {
            if let Some(count) = inner.user_session_count.get_mut(&meta.user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.user_session_count.remove(&meta.user_id);
                }
            }
            if let Some(msgs) = inner.user_message_index.get_mut(&meta.user_id) {
                msgs.remove(&meta.message_id);
                if msgs.is_empty() {
                    inner.user_message_index.remove(&meta.user_id);
                }
            }
        }
    }

    fn evict_oldest_for_user(&self, inner: &mut Inner, user_id: &str) {
        let oldest = inner
            .sessions
            .iter()
            .filter(|(_, meta)| meta.user_id == user_id)
            .min_by_key(|(_, meta)| meta.updated_at)
            .map(|(id, _)| id.clone());
        if let Some(session_id) = oldest {
            tracing::debug!(session_id = %session_id, user_id = %user_id, "evicting user's oldest session");
            self.remove_session_locked(inner, &session_id);
        }
    }

    fn clean_expired_locked(&self, inner: &mut Inner) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.limits.expiration).unwrap_or(chrono::Duration::hours(12));
        let expired: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, meta)| meta.updated_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        let count = expired.len();
        for session_id in expired {
            self.remove_session_locked(inner, &session_id);
        }
        count
    }

    fn force_cleanup_locked(&self, inner: &mut Inner) {
        let swept = self.clean_expired_locked(inner);
        inner.last_cleanup_time = Some(Utc::now());
        inner.cleaned_sessions += swept;

        if self.memory_used() > self.limits.cleanup_mark() {
            let mut by_age: Vec<(String, DateTime<Utc>)> = inner
                .sessions
                .iter()
                .map(|(id, meta)| (id.clone(), meta.updated_at))
                .collect();
            by_age.sort_by_key(|(_, updated_at)| *updated_at);

            let evict = by_age.len() / 5;
            for (session_id, _) in by_age.into_iter().take(evict) {
                self.remove_session_locked(inner, &session_id);
            }
            if evict > 0 {
                tracing::info!(evicted = evict, "memory pressure eviction");
                inner.cleaned_sessions += evict;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
