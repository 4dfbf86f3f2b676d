//! The quota ledger: request-rate and token quotas over a counter store.
//!
//! The ledger never reads a counter and then writes it in a second step.
//! Every admission goes through one `CounterStore::check_and_increment`
//! call, and store failures are returned as they are, without retrying.

use std::sync::Arc;

use promptgate_config::{RateLimit, TokenLimit};
use promptgate_core::{
    Clock, CounterCheck, CounterOutcome, CounterStore, PrincipalId, QuotaKind, StoreError,
    SystemClock, TenantId,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::keys::KeySpace;
use crate::window::{self, HOUR_SECS, MINUTE_SECS};

/// Outcome of a request-rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Window that refused the request.
    pub denied_by: Option<QuotaKind>,
    /// Seconds until the refusing window rolls over; 0 when allowed.
    pub retry_after_secs: u64,
}

impl RateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            denied_by: None,
            retry_after_secs: 0,
        }
    }
}

/// Outcome of a token-quota check.
///
/// For an unenforced limit (bypass or zero) `used` is 0 and `remaining`
/// is `u64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDecision {
    pub allowed: bool,
    pub used: u64,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

impl TokenDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            used: 0,
            remaining: u64::MAX,
            retry_after_secs: 0,
        }
    }
}

/// Read-only view of a principal's token usage in the current period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub used: u64,
    /// 0 when the limit is not enforced.
    pub limit: u64,
    pub remaining: u64,
    pub resets_in_secs: u64,
}

pub struct QuotaLedger {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("store", &self.store.name())
            .field("keys", &self.keys)
            .finish()
    }
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn CounterStore>, keys: KeySpace) -> Self {
        Self::with_clock(store, keys, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, keys: KeySpace, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Check and count one request against the minute and hour windows.
    ///
    /// Windows with a zero limit are neither checked nor counted. Both
    /// windows are incremented only when both admit.
    pub async fn check_rate(
        &self,
        tenant: &TenantId,
        principal: &PrincipalId,
        limits: &RateLimit,
    ) -> Result<RateDecision, StoreError> {
        let now = self.clock.now_secs();

        let active: Vec<(QuotaKind, u64, u64)> = [
            (QuotaKind::Minute, limits.requests_per_minute, MINUTE_SECS),
            (QuotaKind::Hour, limits.requests_per_hour, HOUR_SECS),
        ]
        .into_iter()
        .filter(|&(_, limit, _)| limit > 0)
        .collect();

        if active.is_empty() {
            return Ok(RateDecision::allow());
        }

        let checks: Vec<CounterCheck> = active
            .iter()
            .map(|&(kind, limit, length)| CounterCheck {
                key: self
                    .keys
                    .rate(tenant, principal, kind, window::epoch_start(now, length)),
                limit,
                amount: 1,
                expires_at: window::epoch_end(now, length),
            })
            .collect();

        match self.store.check_and_increment(&checks, now).await? {
            CounterOutcome::Admitted { values } => {
                debug!(tenant = %tenant, principal = %principal, counts = ?values, "Rate check admitted");
                Ok(RateDecision::allow())
            }
            CounterOutcome::Denied {
                index, ttl_secs, ..
            } => {
                let &(kind, _, length) = active.get(index).ok_or_else(|| {
                    StoreError::Malformed(format!("denial index {index} out of range"))
                })?;
                let retry_after_secs = retry_after(ttl_secs, now, length);
                warn!(
                    tenant = %tenant,
                    principal = %principal,
                    window = %kind,
                    retry_after_secs,
                    "Rate limit exceeded"
                );
                Ok(RateDecision {
                    allowed: false,
                    denied_by: Some(kind),
                    retry_after_secs,
                })
            }
        }
    }

    /// Reserve `requested` tokens from the current period.
    ///
    /// A request that would take usage past the limit is refused and
    /// leaves usage unchanged.
    pub async fn check_tokens(
        &self,
        tenant: &TenantId,
        principal: &PrincipalId,
        limit: &TokenLimit,
        requested: u64,
    ) -> Result<TokenDecision, StoreError> {
        if !limit.is_enforced() {
            return Ok(TokenDecision::unlimited());
        }

        let now = self.clock.now_secs();
        let period = limit.period_secs();
        let check = CounterCheck {
            key: self
                .keys
                .tokens(tenant, principal, window::epoch_start(now, period)),
            limit: limit.tokens_per_period,
            amount: requested,
            expires_at: window::epoch_end(now, period),
        };

        match self.store.check_and_increment(&[check], now).await? {
            CounterOutcome::Admitted { values } => {
                let used = values.first().copied().ok_or_else(|| {
                    StoreError::Malformed("admitted batch returned no values".into())
                })?;
                debug!(tenant = %tenant, principal = %principal, requested, used, "Token check admitted");
                Ok(TokenDecision {
                    allowed: true,
                    used,
                    remaining: limit.tokens_per_period.saturating_sub(used),
                    retry_after_secs: 0,
                })
            }
            CounterOutcome::Denied {
                current, ttl_secs, ..
            } => {
                let retry_after_secs = retry_after(ttl_secs, now, period);
                warn!(
                    tenant = %tenant,
                    principal = %principal,
                    requested,
                    used = current,
                    limit = limit.tokens_per_period,
                    retry_after_secs,
                    "Token quota exceeded"
                );
                Ok(TokenDecision {
                    allowed: false,
                    used: current,
                    remaining: limit.tokens_per_period.saturating_sub(current),
                    retry_after_secs,
                })
            }
        }
    }

    /// Reconcile a reservation with the tokens actually consumed.
    ///
    /// Charges the overrun or refunds the unused part. Never refuses.
    /// Returns the usage after reconciliation.
    pub async fn commit_tokens(
        &self,
        tenant: &TenantId,
        principal: &PrincipalId,
        limit: &TokenLimit,
        reserved: u64,
        actual: u64,
    ) -> Result<u64, StoreError> {
        if !limit.is_enforced() {
            return Ok(0);
        }

        let now = self.clock.now_secs();
        let period = limit.period_secs();
        let key = self
            .keys
            .tokens(tenant, principal, window::epoch_start(now, period));

        let delta = i128::from(actual) - i128::from(reserved);
        let delta = i64::try_from(delta)
            .map_err(|_| StoreError::Malformed(format!("token delta out of range: {delta}")))?;
        if delta == 0 {
            return self.store.current(&key, now).await;
        }

        let used = self
            .store
            .adjust(&key, delta, window::epoch_end(now, period), now)
            .await?;
        debug!(tenant = %tenant, principal = %principal, reserved, actual, used, "Token usage committed");
        Ok(used)
    }

    pub async fn token_usage(
        &self,
        tenant: &TenantId,
        principal: &PrincipalId,
        limit: &TokenLimit,
    ) -> Result<TokenUsage, StoreError> {
        let now = self.clock.now_secs();
        let period = limit.period_secs();
        let resets_in_secs = window::secs_until_rollover(now, period);

        if !limit.is_enforced() {
            return Ok(TokenUsage {
                used: 0,
                limit: 0,
                remaining: u64::MAX,
                resets_in_secs,
            });
        }

        let key = self
            .keys
            .tokens(tenant, principal, window::epoch_start(now, period));
        let used = self.store.current(&key, now).await?;
        Ok(TokenUsage {
            used,
            limit: limit.tokens_per_period,
            remaining: limit.tokens_per_period.saturating_sub(used),
            resets_in_secs,
        })
    }
}

/// The store's TTL when it reported one, otherwise time to the epoch end.
fn retry_after(ttl_secs: u64, now: u64, length: u64) -> u64 {
    if ttl_secs > 0 {
        ttl_secs
    } else {
        window::secs_until_rollover(now, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryCounterStore;
    use async_trait::async_trait;
    use promptgate_core::ManualClock;

    const T0: u64 = 1_700_000_020; // 40s into a minute

    fn setup() -> (QuotaLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let ledger = QuotaLedger::with_clock(
            Arc::new(InMemoryCounterStore::new()),
            KeySpace::default(),
            clock.clone(),
        );
        (ledger, clock)
    }

    fn ids() -> (TenantId, PrincipalId) {
        (TenantId::from("guild-1"), PrincipalId::from("user-1"))
    }

    fn rate(per_minute: u64, per_hour: u64) -> RateLimit {
        RateLimit {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
        }
    }

    fn tokens(limit: u64) -> TokenLimit {
        TokenLimit {
            bypass: false,
            tokens_per_period: limit,
            period_hours: 24,
        }
    }

    #[tokio::test]
    async fn minute_window_denies_then_rolls_over() {
        let (ledger, clock) = setup();
        let (tenant, user) = ids();
        let limits = rate(3, 10);

        for _ in 0..3 {
            assert!(ledger.check_rate(&tenant, &user, &limits).await.unwrap().allowed);
        }

        let denied = ledger.check_rate(&tenant, &user, &limits).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.denied_by, Some(QuotaKind::Minute));
        assert_eq!(denied.retry_after_secs, 20);

        clock.advance(20);
        let after = ledger.check_rate(&tenant, &user, &limits).await.unwrap();
        assert!(after.allowed);
    }

    #[tokio::test]
    async fn minute_denial_does_not_count_against_hour() {
        let (ledger, clock) = setup();
        let (tenant, user) = ids();
        let limits = rate(1, 3);

        // Each minute: one admitted, several refused. Only admissions count
        // toward the hour.
        for _ in 0..3 {
            assert!(ledger.check_rate(&tenant, &user, &limits).await.unwrap().allowed);
            for _ in 0..5 {
                let d = ledger.check_rate(&tenant, &user, &limits).await.unwrap();
                assert_eq!(d.denied_by, Some(QuotaKind::Minute));
            }
            clock.advance(60);
        }

        let d = ledger.check_rate(&tenant, &user, &limits).await.unwrap();
        assert_eq!(d.denied_by, Some(QuotaKind::Hour));
        assert!(d.retry_after_secs > 0);
    }

    #[tokio::test]
    async fn zero_limits_never_deny() {
        let (ledger, _) = setup();
        let (tenant, user) = ids();
        for _ in 0..100 {
            assert!(ledger.check_rate(&tenant, &user, &rate(0, 0)).await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn zero_minute_limit_still_enforces_hour() {
        let (ledger, _) = setup();
        let (tenant, user) = ids();
        let limits = rate(0, 2);
        assert!(ledger.check_rate(&tenant, &user, &limits).await.unwrap().allowed);
        assert!(ledger.check_rate(&tenant, &user, &limits).await.unwrap().allowed);
        let d = ledger.check_rate(&tenant, &user, &limits).await.unwrap();
        assert_eq!(d.denied_by, Some(QuotaKind::Hour));
    }

    #[tokio::test]
    async fn principals_are_isolated() {
        let (ledger, _) = setup();
        let tenant = TenantId::from("guild-1");
        let limits = rate(1, 0);
        let a = PrincipalId::from("a");
        let b = PrincipalId::from("b");
        assert!(ledger.check_rate(&tenant, &a, &limits).await.unwrap().allowed);
        assert!(ledger.check_rate(&tenant, &b, &limits).await.unwrap().allowed);
        assert!(!ledger.check_rate(&tenant, &a, &limits).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn token_denial_leaves_usage_unchanged() {
        let (ledger, _) = setup();
        let (tenant, user) = ids();
        let limit = tokens(100);

        let first = ledger.check_tokens(&tenant, &user, &limit, 30).await.unwrap();
        assert!(first.allowed);
        assert_eq!((first.used, first.remaining), (30, 70));

        let second = ledger.check_tokens(&tenant, &user, &limit, 50).await.unwrap();
        assert!(second.allowed);
        assert_eq!((second.used, second.remaining), (80, 20));

        let third = ledger.check_tokens(&tenant, &user, &limit, 30).await.unwrap();
        assert!(!third.allowed);
        assert_eq!((third.used, third.remaining), (80, 20));
        assert!(third.retry_after_secs > 0);

        let usage = ledger.token_usage(&tenant, &user, &limit).await.unwrap();
        assert_eq!(usage.used, 80);
    }

    #[tokio::test]
    async fn exact_fit_is_admitted() {
        let (ledger, _) = setup();
        let (tenant, user) = ids();
        let d = ledger.check_tokens(&tenant, &user, &tokens(100), 100).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[tokio::test]
    async fn bypass_and_zero_limit_always_allow() {
        let (ledger, _) = setup();
        let (tenant, user) = ids();
        for limit in [TokenLimit::bypassed(), tokens(0)] {
            let d = ledger
                .check_tokens(&tenant, &user, &limit, 1_000_000)
                .await
                .unwrap();
            assert!(d.allowed);
            assert_eq!(d.used, 0);
        }
    }

    #[tokio::test]
    async fn token_period_rolls_over() {
        let (ledger, clock) = setup();
        let (tenant, user) = ids();
        let limit = TokenLimit {
            bypass: false,
            tokens_per_period: 10,
            period_hours: 1,
        };

        assert!(ledger.check_tokens(&tenant, &user, &limit, 10).await.unwrap().allowed);
        let denied = ledger.check_tokens(&tenant, &user, &limit, 1).await.unwrap();
        assert!(!denied.allowed);

        clock.advance(denied.retry_after_secs);
        let d = ledger.check_tokens(&tenant, &user, &limit, 1).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.used, 1);
    }

    #[tokio::test]
    async fn commit_reconciles_reservation() {
        let (ledger, _) = setup();
        let (tenant, user) = ids();
        let limit = tokens(1_000);

        ledger.check_tokens(&tenant, &user, &limit, 500).await.unwrap();
        // Used less than reserved: refund.
        assert_eq!(
            ledger.commit_tokens(&tenant, &user, &limit, 500, 320).await.unwrap(),
            320
        );
        ledger.check_tokens(&tenant, &user, &limit, 100).await.unwrap();
        // Used more than reserved: charge the overrun, even past the limit.
        assert_eq!(
            ledger.commit_tokens(&tenant, &user, &limit, 100, 900).await.unwrap(),
            1_220
        );
        assert_eq!(
            ledger.commit_tokens(&tenant, &user, &limit, 10, 10).await.unwrap(),
            1_220
        );
    }

    #[tokio::test]
    async fn usage_reports_reset_time() {
        let (ledger, _) = setup();
        let (tenant, user) = ids();
        let usage = ledger.token_usage(&tenant, &user, &tokens(500)).await.unwrap();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.remaining, 500);
        assert_eq!(usage.resets_in_secs, 86_400 - T0 % 86_400);
    }

    #[tokio::test]
    async fn past_epoch_counters_do_not_accumulate() {
        let store = Arc::new(InMemoryCounterStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let ledger = QuotaLedger::with_clock(store.clone(), KeySpace::default(), clock.clone());
        let (tenant, user) = ids();
        let limits = rate(3, 10);

        for _ in 0..500 {
            assert!(ledger.check_rate(&tenant, &user, &limits).await.unwrap().allowed);
            clock.advance(3600);
        }
        // Only the latest minute and hour counters remain.
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_limit() {
        let (ledger, _) = setup();
        let ledger = Arc::new(ledger);
        let limits = rate(5, 0);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let (tenant, user) = ids();
                ledger.check_rate(&tenant, &user, &limits).await.unwrap().allowed
            }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        fn name(&self) -> &str {
            "down"
        }

        async fn check_and_increment(
            &self,
            _: &[CounterCheck],
            _: u64,
        ) -> Result<CounterOutcome, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn adjust(&self, _: &str, _: i64, _: u64, _: u64) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn current(&self, _: &str, _: u64) -> Result<u64, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn store_failure_is_surfaced() {
        let ledger = QuotaLedger::new(Arc::new(DownStore), KeySpace::default());
        let (tenant, user) = ids();
        let err = ledger
            .check_rate(&tenant, &user, &rate(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(ledger.check_tokens(&tenant, &user, &tokens(10), 1).await.is_err());
        // Nothing to ask the store when no window is enforced.
        assert!(ledger.check_rate(&tenant, &user, &rate(0, 0)).await.is_ok());
    }
}
