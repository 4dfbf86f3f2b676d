//! In-memory counter store, for tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use promptgate_core::error::StoreError;
use promptgate_core::store::{CounterCheck, CounterOutcome, CounterStore};
use tokio::sync::Mutex;
use tracing::debug;

use crate::window::MINUTE_SECS;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: u64,
}

impl Counter {
    fn live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Counters {
    entries: HashMap<String, Counter>,
    /// Minute of the last sweep of expired entries.
    swept_minute: u64,
}

impl Counters {
    fn purge(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, c| c.live(now));
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired counters");
        }
        removed
    }

    /// Drop expired entries, at most once per minute of `now`. Keys of
    /// past epochs are never read again and only leave through here.
    fn sweep(&mut self, now: u64) {
        let minute = now / MINUTE_SECS;
        if minute > self.swept_minute {
            self.swept_minute = minute;
            self.purge(now);
        }
    }

    fn live_value(&self, key: &str, now: u64) -> Option<Counter> {
        self.entries.get(key).copied().filter(|c| c.live(now))
    }
}

/// Counters in a map behind one mutex. A whole batch runs under the lock,
/// which makes check-and-increment indivisible within the process.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<Counters>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every counter that expired at or before `now`. Returns how
    /// many were removed.
    pub async fn purge_expired(&self, now: u64) -> usize {
        self.counters.lock().await.purge(now)
    }

    pub async fn len(&self) -> usize {
        self.counters.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.counters.lock().await.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn check_and_increment(
        &self,
        checks: &[CounterCheck],
        now: u64,
    ) -> Result<CounterOutcome, StoreError> {
        let mut counters = self.counters.lock().await;
        counters.sweep(now);

        for (index, check) in checks.iter().enumerate() {
            let existing = counters.live_value(&check.key, now);
            let current = existing.map_or(0, |c| c.value);
            if current.saturating_add(check.amount) > check.limit {
                return Ok(CounterOutcome::Denied {
                    index,
                    current,
                    ttl_secs: existing.map_or(0, |c| c.expires_at - now),
                });
            }
        }

        let values = checks
            .iter()
            .map(|check| {
                let counter = match counters.live_value(&check.key, now) {
                    Some(c) => Counter {
                        value: c.value + check.amount,
                        expires_at: c.expires_at,
                    },
                    None => Counter {
                        value: check.amount,
                        expires_at: check.expires_at,
                    },
                };
                counters.entries.insert(check.key.clone(), counter);
                counter.value
            })
            .collect();

        Ok(CounterOutcome::Admitted { values })
    }

    async fn adjust(
        &self,
        key: &str,
        delta: i64,
        expires_at: u64,
        now: u64,
    ) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock().await;
        counters.sweep(now);
        let existing = counters.live_value(key, now);
        let current = existing.map_or(0, |c| c.value);
        let value = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        counters.entries.insert(
            key.to_string(),
            Counter {
                value,
                expires_at: existing.map_or(expires_at, |c| c.expires_at),
            },
        );
        Ok(value)
    }

    async fn current(&self, key: &str, now: u64) -> Result<u64, StoreError> {
        let counters = self.counters.lock().await;
        Ok(counters.live_value(key, now).map_or(0, |c| c.value))
    }
}
