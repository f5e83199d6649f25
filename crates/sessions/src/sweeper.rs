//! Background maintenance for the session cache: a periodic TTL sweep and
//! a memory monitor that triggers forced cleanup under pressure.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cache::SessionCache;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the hourly TTL sweeper and the per-minute memory monitor.
/// Both exit when `shutdown` is cancelled.
pub fn spawn_background_tasks(cache: Arc<SessionCache>, shutdown: CancellationToken) {
    {
        let cache = cache.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let swept = cache.clean_expired_sessions();
                        if swept > 0 {
                            tracing::info!(swept, "expired sessions cleaned");
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let used = cache.memory_used();
                    if used > cache.limits().warn_mark() {
                        tracing::warn!(
                            used_mb = used as f64 / 1024.0 / 1024.0,
                            "session memory above warning mark, forcing cleanup"
                        );
                        cache.force_cleanup();
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use cf_domain::message::{Message, Role};

    #[tokio::test]
    async fn shutdown_stops_tasks() {
        let cache = Arc::new(SessionCache::new());
        let shutdown = CancellationToken::new();
        spawn_background_tasks(cache, shutdown.clone());
        shutdown.cancel();
        // Give the tasks a moment to observe cancellation; nothing to
        // assert beyond "no panic / no hang".
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn monitor_thresholds_line_up() {
        let cache = SessionCache::with_limits(CacheLimits {
            memory_limit: 1000,
            ..CacheLimits::default()
        });
        assert_eq!(cache.limits().warn_mark(), 800);
        assert_eq!(cache.limits().cleanup_mark(), 900);

        cache
            .set_messages(
                "S1",
                "U1",
                vec![Message::new(Role::User, "x".repeat(500))],
                "",
                "M1",
                "",
                "",
            )
            .unwrap();
        assert!(cache.memory_used() < cache.limits().warn_mark());
    }
}
