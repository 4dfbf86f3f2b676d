//! SQLite counter store.
//!
//! One table, `quota_counters`, keyed by the full counter key. Every
//! operation runs in a transaction whose first statement deletes the key's
//! expired row. Starting with a write takes SQLite's write lock up front,
//! so the read-check-increment that follows cannot interleave with another
//! connection's. Rows of past epochs are swept inside the same transaction,
//! at most once per minute of `now` per store handle.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use promptgate_core::error::StoreError;
use promptgate_core::store::{CounterCheck, CounterOutcome, CounterStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::window::MINUTE_SECS;

pub struct SqliteCounterStore {
    pool: SqlitePool,
    swept_minute: AtomicU64,
}

fn unavailable(context: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Unavailable(format!("{context}: {e}"))
}

fn to_sql(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Malformed(format!("value out of range: {value}")))
}

fn from_sql(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Malformed(format!("negative counter: {value}")))
}

impl SqliteCounterStore {
    /// Open (or create) the database at `path`.
    ///
    /// In-memory databases (`sqlite::memory:`) are private to a connection,
    /// so the pool is pinned to a single connection for them.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Unavailable(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(unavailable("Failed to open SQLite"))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite counter store initialized at {path}");
        Ok(store)
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            swept_minute: AtomicU64::new(0),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_counters (
                key         TEXT PRIMARY KEY NOT NULL,
                value       INTEGER NOT NULL,
                expires_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable("quota_counters table"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_quota_counters_expires_at ON quota_counters(expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable("expires_at index"))?;

        Ok(())
    }

    /// Delete every counter that expired at or before `now`.
    pub async fn purge_expired(&self, now: u64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM quota_counters WHERE expires_at <= ?")
            .bind(to_sql(now)?)
            .execute(&self.pool)
            .await
            .map_err(unavailable("purge"))?;
        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "Purged expired counters");
        }
        Ok(removed)
    }

    /// Number of stored rows, live or expired.
    pub async fn row_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM quota_counters")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable("count counters"))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        from_sql(n)
    }

    fn sweep_due(&self, now: u64) -> bool {
        let minute = now / MINUTE_SECS;
        self.swept_minute.fetch_max(minute, Ordering::Relaxed) < minute
    }

    /// Delete expired rows inside the caller's transaction, when a sweep
    /// is due for this minute.
    async fn sweep(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        now: u64,
    ) -> Result<(), StoreError> {
        if !self.sweep_due(now) {
            return Ok(());
        }
        let result = sqlx::query("DELETE FROM quota_counters WHERE expires_at <= ?")
            .bind(to_sql(now)?)
            .execute(&mut **tx)
            .await
            .map_err(unavailable("sweep"))?;
        if result.rows_affected() > 0 {
            debug!(removed = result.rows_affected(), "Swept expired counters");
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Sqlite>, StoreError> {
        self.pool.begin().await.map_err(unavailable("begin"))
    }

    async fn reclaim(
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM quota_counters WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(unavailable("reclaim"))?;
        Ok(())
    }

    async fn load(
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
    ) -> Result<Option<(u64, u64)>, StoreError> {
        let row = sqlx::query("SELECT value, expires_at FROM quota_counters WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(unavailable("read counter"))?;

        row.map(|r| {
            let value: i64 = r
                .try_get("value")
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            let expires_at: i64 = r
                .try_get("expires_at")
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            Ok((from_sql(value)?, from_sql(expires_at)?))
        })
        .transpose()
    }

    async fn upsert(
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
        value: u64,
        expires_at: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_counters (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(to_sql(value)?)
        .bind(to_sql(expires_at)?)
        .execute(&mut **tx)
        .await
        .map_err(unavailable("write counter"))?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for SqliteCounterStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn check_and_increment(
        &self,
        checks: &[CounterCheck],
        now: u64,
    ) -> Result<CounterOutcome, StoreError> {
        let now_sql = to_sql(now)?;
        let mut tx = self.begin().await?;

        for check in checks {
            Self::reclaim(&mut tx, &check.key, now_sql).await?;
        }
        self.sweep(&mut tx, now).await?;

        let mut currents = Vec::with_capacity(checks.len());
        for (index, check) in checks.iter().enumerate() {
            let existing = Self::load(&mut tx, &check.key).await?;
            let current = existing.map_or(0, |(value, _)| value);
            if current.saturating_add(check.amount) > check.limit {
                tx.rollback().await.map_err(unavailable("rollback"))?;
                return Ok(CounterOutcome::Denied {
                    index,
                    current,
                    ttl_secs: existing.map_or(0, |(_, exp)| exp.saturating_sub(now)),
                });
            }
            currents.push(current);
        }

        let mut values = Vec::with_capacity(checks.len());
        for (check, current) in checks.iter().zip(currents) {
            let value = current + check.amount;
            Self::upsert(&mut tx, &check.key, value, check.expires_at).await?;
            values.push(value);
        }

        tx.commit().await.map_err(unavailable("commit"))?;
        Ok(CounterOutcome::Admitted { values })
    }

    async fn adjust(
        &self,
        key: &str,
        delta: i64,
        expires_at: u64,
        now: u64,
    ) -> Result<u64, StoreError> {
        let now_sql = to_sql(now)?;
        let mut tx = self.begin().await?;
        Self::reclaim(&mut tx, key, now_sql).await?;
        self.sweep(&mut tx, now).await?;

        let current = Self::load(&mut tx, key).await?.map_or(0, |(value, _)| value);
        let value = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            current.saturating_sub(delta.unsigned_abs())
        };
        Self::upsert(&mut tx, key, value, expires_at).await?;

        tx.commit().await.map_err(unavailable("commit"))?;
        Ok(value)
    }

    async fn current(&self, key: &str, now: u64) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT value FROM quota_counters WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(to_sql(now)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("read counter"))?;

        match row {
            Some(r) => {
                let value: i64 = r
                    .try_get("value")
                    .map_err(|e| StoreError::Malformed(e.to_string()))?;
                from_sql(value)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_store() -> SqliteCounterStore {
        SqliteCounterStore::new("sqlite::memory:").await.unwrap()
    }

    fn check(key: &str, limit: u64, amount: u64, expires_at: u64) -> CounterCheck {
        CounterCheck {
            key: key.into(),
            limit,
            amount,
            expires_at,
        }
    }

    #[tokio::test]
    async fn increments_until_limit() {
        let store = test_store().await;
        for expected in 1..=2 {
            let outcome = store
                .check_and_increment(&[check("k", 2, 1, 60)], 0)
                .await
                .unwrap();
            assert_eq!(outcome, CounterOutcome::Admitted { values: vec![expected] });
        }
        let denied = store
            .check_and_increment(&[check("k", 2, 1, 60)], 15)
            .await
            .unwrap();
        assert_eq!(
            denied,
            CounterOutcome::Denied {
                index: 0,
                current: 2,
                ttl_secs: 45,
            }
        );
    }

    #[tokio::test]
    async fn denied_batch_is_rolled_back() {
        let store = test_store().await;
        store.adjust("b", 1, 100, 0).await.unwrap();

        let outcome = store
            .check_and_increment(&[check("a", 5, 1, 100), check("b", 1, 1, 100)], 0)
            .await
            .unwrap();
        assert!(matches!(outcome, CounterOutcome::Denied { index: 1, .. }));
        assert_eq!(store.current("a", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_row_is_reclaimed() {
        let store = test_store().await;
        store
            .check_and_increment(&[check("k", 1, 1, 60)], 0)
            .await
            .unwrap();
        assert_eq!(store.current("k", 60).await.unwrap(), 0);

        let outcome = store
            .check_and_increment(&[check("k", 1, 1, 120)], 60)
            .await
            .unwrap();
        assert_eq!(outcome, CounterOutcome::Admitted { values: vec![1] });
        assert_eq!(store.current("k", 119).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn adjust_refunds_and_saturates() {
        let store = test_store().await;
        assert_eq!(store.adjust("k", 80, 100, 0).await.unwrap(), 80);
        assert_eq!(store.adjust("k", -30, 100, 0).await.unwrap(), 50);
        assert_eq!(store.adjust("k", -500, 100, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_deletes_expired_rows() {
        let store = test_store().await;
        store.adjust("old", 1, 10, 0).await.unwrap();
        store.adjust("new", 1, 100, 0).await.unwrap();
        assert_eq!(store.purge_expired(10).await.unwrap(), 1);
        assert_eq!(store.current("new", 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_epochs_are_swept_on_write() {
        let store = test_store().await;
        let mut now = 1_700_000_000;
        for _ in 0..100 {
            let epoch = now / 3600 * 3600;
            let key = format!("t:ratelimit:u:hour:{epoch}");
            store
                .check_and_increment(&[check(&key, 10, 1, epoch + 3600)], now)
                .await
                .unwrap();
            now += 3600;
        }
        assert_eq!(store.row_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("sqlite://{}", dir.path().join("quota.db").display());

        let store = SqliteCounterStore::new(&path).await.unwrap();
        store.adjust("k", 7, 1_000, 0).await.unwrap();
        drop(store);

        let reopened = SqliteCounterStore::new(&path).await.unwrap();
        assert_eq!(reopened.current("k", 0).await.unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_admit_exactly_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("sqlite://{}", dir.path().join("quota.db").display());
        let store = Arc::new(SqliteCounterStore::new(&path).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .check_and_increment(&[check("shared", 7, 1, 1_000)], 0)
                    .await
                    .unwrap()
                    .is_admitted()
            }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);
        assert_eq!(store.current("shared", 0).await.unwrap(), 7);
    }
}
