//! In-memory session cache for the CardFlow gateway.
//!
//! One [`SessionMeta`] per active session, bounded by per-user and global
//! session counts and by total serialized size, with TTL-based expiry and
//! pressure-triggered eviction. Nothing here survives a restart.

mod cache;
mod sweeper;

pub use cache::{
    CacheLimits, SessionCache, SessionMeta, SessionStats, DEFAULT_EXPIRATION,
    MAX_MESSAGES_PER_SESSION, MAX_SESSIONS_PER_USER, MAX_TOTAL_SESSIONS, MEMORY_LIMIT,
};
pub use sweeper::spawn_background_tasks;
