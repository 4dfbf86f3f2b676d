//! Counter store trait: the shared, concurrently accessed quota state.
//!
//! Quota correctness rests entirely on the store: a batch of counter checks
//! must be evaluated and incremented as one indivisible operation, on the
//! store's side. Implementations must never split the check and the
//! increment into two round trips.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// One counter to check and, if the whole batch passes, increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterCheck {
    /// Fully namespaced key (tenant, principal, window kind, epoch).
    pub key: String,
    /// Ceiling the counter may reach. Always non-zero: unlimited windows are
    /// filtered out before reaching the store.
    pub limit: u64,
    /// Amount to add on success.
    pub amount: u64,
    /// Unix second at which a freshly created counter expires (epoch end).
    pub expires_at: u64,
}

/// Result of an atomic check-and-increment over a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOutcome {
    /// Every counter passed and was incremented. Values are post-increment,
    /// in batch order.
    Admitted { values: Vec<u64> },
    /// The check at `index` failed; no counter in the batch was mutated.
    Denied {
        index: usize,
        current: u64,
        /// Seconds until the failing counter expires, 0 if unknown.
        ttl_secs: u64,
    },
}

impl CounterOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Shared counter store with an atomic, server-side check-and-increment.
///
/// `now` is the caller's Unix time in seconds. A counter whose `expires_at`
/// is at or before `now` is treated as absent (zero), even if the store has
/// not reclaimed it yet.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Human-readable store name (e.g. "in_memory", "sqlite").
    fn name(&self) -> &str;

    /// Evaluate `checks` in order. The first check where
    /// `current + amount > limit` denies the whole batch without mutation;
    /// otherwise every counter is incremented, creating missing ones with
    /// their `expires_at`.
    async fn check_and_increment(
        &self,
        checks: &[CounterCheck],
        now: u64,
    ) -> Result<CounterOutcome, StoreError>;

    /// Unconditionally add `delta` (may be negative, saturating at zero).
    /// Returns the new value.
    async fn adjust(
        &self,
        key: &str,
        delta: i64,
        expires_at: u64,
        now: u64,
    ) -> Result<u64, StoreError>;

    /// Read the current value without mutating it.
    async fn current(&self, key: &str, now: u64) -> Result<u64, StoreError>;
}
