//! Inbound idempotency store.
//!
//! The chat platform redelivers webhook events on slow responses and
//! reconnects, so every event id is tracked with a TTL and duplicates are
//! dropped before any work starts. This sits in front of the session
//! cache's own (user, message) dedup, which exists to protect history
//! writes rather than event delivery.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
/// Lazy cleanup threshold.
const CLEANUP_LEN: usize = 10_000;

pub struct ProcessedCache {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for ProcessedCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ProcessedCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` if this event id was already seen (duplicate).
    pub fn check_and_insert(&self, event_id: &str) -> bool {
        let mut map = self.seen.lock();
        let now = Instant::now();

        if map.len() > CLEANUP_LEN {
            let ttl = self.ttl;
            map.retain(|_, ts| now.duration_since(*ts) < ttl);
        }

        if let Some(ts) = map.get(event_id) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }

        map.insert(event_id.to_owned(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sight_is_not_duplicate() {
        let cache = ProcessedCache::default();
        assert!(!cache.check_and_insert("E1"));
        assert!(cache.check_and_insert("E1"));
    }

    #[test]
    fn distinct_ids_independent() {
        let cache = ProcessedCache::default();
        assert!(!cache.check_and_insert("E1"));
        assert!(!cache.check_and_insert("E2"));
    }

    #[test]
    fn expired_id_reaccepted() {
        let cache = ProcessedCache::new(Duration::from_millis(0));
        assert!(!cache.check_and_insert("E1"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.check_and_insert("E1"));
    }
}
