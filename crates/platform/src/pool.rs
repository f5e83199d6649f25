//! Pre-created card pool.
//!
//! Creating a card entity costs a round-trip to the platform; the pool
//! keeps a FIFO of ready card ids so the request path only pays a dequeue.
//! Consumed slots are refilled asynchronously, and the whole pool is
//! rebuilt once a day (card entities go stale after 24 h on the platform
//! side).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use cf_domain::error::{Error, Result};

pub const POOL_CAPACITY: usize = 20;
const MAX_CREATE_ATTEMPTS: u32 = 3;
const CREATE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Creates card entities for the pool.
#[async_trait::async_trait]
pub trait CardCreator: Send + Sync {
    async fn create_card(&self) -> Result<String>;
}

struct CardEntry {
    card_id: String,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

struct PoolInner {
    cards: Mutex<VecDeque<CardEntry>>,
    capacity: usize,
    creator: Arc<dyn CardCreator>,
    shutdown: CancellationToken,
}

/// Handle to the shared pool; cheap to clone.
#[derive(Clone)]
pub struct CardPool {
    inner: Arc<PoolInner>,
}

impl CardPool {
    /// Build a pool and fill it synchronously to [`POOL_CAPACITY`]. A
    /// creation failure that survives the retry budget fails construction.
    pub async fn new(creator: Arc<dyn CardCreator>) -> Result<Self> {
        Self::with_capacity(creator, POOL_CAPACITY).await
    }

    pub async fn with_capacity(creator: Arc<dyn CardCreator>, capacity: usize) -> Result<Self> {
        let pool = Self {
            inner: Arc::new(PoolInner {
                cards: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                creator,
                shutdown: CancellationToken::new(),
            }),
        };

        pool.inner.fill().await?;
        tracing::info!(size = pool.size(), "card pool filled");

        let rebuild = pool.inner.clone();
        tokio::spawn(async move { rebuild.rebuild_at_midnight().await });

        Ok(pool)
    }

    /// Take a card id from the pool.
    ///
    /// A dequeue kicks off an async one-slot refill; an empty pool falls
    /// back to creating synchronously (with retry) plus the async refill.
    /// The returned id is not validated — a consumer that cannot use it
    /// treats that like any other card failure.
    pub async fn get_card(&self) -> Result<String> {
        let popped = self.inner.cards.lock().pop_front();
        match popped {
            Some(entry) => {
                tracing::debug!(card_id = %entry.card_id, remaining = self.size(), "card taken from pool");
                self.inner.spawn_refill();
                Ok(entry.card_id)
            }
            None => {
                tracing::warn!("card pool empty, creating on demand");
                let card_id = self.inner.create_with_retry().await?;
                self.inner.spawn_refill();
                Ok(card_id)
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner.cards.lock().len()
    }

    /// Stop background work. Idempotent; in-flight refills observe the
    /// cancellation and no further cards are created.
    pub fn stop(&self) {
        self.inner.shutdown.cancel();
    }
}

impl PoolInner {
    async fn fill(&self) -> Result<()> {
        while self.cards.lock().len() < self.capacity {
            let card_id = self.create_with_retry().await?;
            self.push(card_id);
        }
        Ok(())
    }

    fn push(&self, card_id: String) {
        let mut cards = self.cards.lock();
        if cards.len() < self.capacity {
            cards.push_back(CardEntry {
                card_id,
                created_at: Utc::now(),
            });
        }
    }

    fn spawn_refill(self: &Arc<Self>) {
        let pool = self.clone();
        tokio::spawn(async move {
            if pool.shutdown.is_cancelled() {
                return;
            }
            match pool.create_with_retry().await {
                Ok(card_id) => pool.push(card_id),
                Err(e) => tracing::warn!(error = %e, "card pool refill failed"),
            }
        });
    }

    /// Shared creation loop: up to three attempts with one second between,
    /// returning after the first success. Aborts when the pool is stopped.
    async fn create_with_retry(&self) -> Result<String> {
        let mut last_error = None;
        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            if self.shutdown.is_cancelled() {
                return Err(Error::Other("card pool is stopped".into()));
            }
            if attempt > 1 {
                tokio::select! {
                    _ = tokio::time::sleep(CREATE_RETRY_INTERVAL) => {}
                    _ = self.shutdown.cancelled() => {
                        return Err(Error::Other("card pool is stopped".into()));
                    }
                }
            }
            match self.creator.create_card().await {
                Ok(card_id) => return Ok(card_id),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "card creation failed");
                    last_error = Some(e);
                }
            }
        }
        Err(Error::Other(format!(
            "failed to create card after {MAX_CREATE_ATTEMPTS} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn rebuild_at_midnight(self: Arc<Self>) {
        loop {
            let until = duration_until_local_midnight();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(until) => {
                    tracing::info!("starting daily card pool rebuild");
                    self.cards.lock().clear();
                    if let Err(e) = self.fill().await {
                        tracing::error!(error = %e, "card pool rebuild failed");
                    }
                }
            }
        }
    }
}

fn duration_until_local_midnight() -> Duration {
    let now = chrono::Local::now();
    let tomorrow = (now + chrono::Duration::days(1)).date_naive();
    let midnight = tomorrow
        .and_hms_opt(0, 0, 0)
        .expect("00:00:00 is valid")
        .and_local_timezone(chrono::Local)
        .earliest();
    match midnight {
        Some(next) => (next - now)
            .to_std()
            .unwrap_or(Duration::from_secs(24 * 60 * 60)),
        None => Duration::from_secs(24 * 60 * 60),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
