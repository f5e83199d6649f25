//! Per-user daily access counter.
//!
//! When enabled, each user gets a fixed number of turns per calendar day
//! (UTC). Counters reset implicitly when the date rolls over.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;

pub struct AccessControl {
    enabled: bool,
    max_per_day: u32,
    inner: Mutex<DayCounters>,
}

struct DayCounters {
    date: NaiveDate,
    counts: HashMap<String, u32>,
}

impl AccessControl {
    pub fn new(enabled: bool, max_per_day: u32) -> Self {
        Self {
            enabled,
            max_per_day,
            inner: Mutex::new(DayCounters {
                date: Utc::now().date_naive(),
                counts: HashMap::new(),
            }),
        }
    }

    /// Check the user's remaining allowance and consume one unit of it.
    /// Always `true` when access control is disabled or unlimited.
    pub fn allow_and_increment(&self, user_id: &str) -> bool {
        if !self.enabled || self.max_per_day == 0 {
            return true;
        }

        let mut inner = self.inner.lock();
        let today = Utc::now().date_naive();
        if inner.date != today {
            inner.date = today;
            inner.counts.clear();
        }

        let count = inner.counts.entry(user_id.to_owned()).or_insert(0);
        if *count >= self.max_per_day {
            return false;
        }
        *count += 1;
        true
    }

    /// Turns the user has used today.
    pub fn used_today(&self, user_id: &str) -> u32 {
        let inner = self.inner.lock();
        if inner.date != Utc::now().date_naive() {
            return 0;
        }
        inner.counts.get(user_id).copied().unwrap_or(0)
    }
}
