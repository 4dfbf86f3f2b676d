//! Quota enforcement for PromptGate.
//!
//! Two quota types share one discipline: check and increment in a single
//! indivisible store operation.
//!
//! - **Rate**: minute and hour request windows, evaluated as one batch
//! - **Tokens**: one budget per fixed period, with reservation and
//!   post-call reconciliation
//!
//! Counter stores:
//! - `InMemoryCounterStore`: single process, tests
//! - `SqliteCounterStore`: shared between processes on one host (feature `sqlite`)

pub mod in_memory;
pub mod keys;
pub mod ledger;
pub mod window;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use promptgate_config::StoreConfig;
use promptgate_core::{CounterStore, StoreError};

pub use in_memory::InMemoryCounterStore;
pub use keys::KeySpace;
pub use ledger::{QuotaLedger, RateDecision, TokenDecision, TokenUsage};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCounterStore;

/// Build the counter store named in configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn CounterStore>, StoreError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryCounterStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let path = config.path.as_deref().ok_or_else(|| {
                StoreError::Unavailable("store.path is required for the sqlite backend".into())
            })?;
            Ok(Arc::new(SqliteCounterStore::new(path).await?))
        }
        other => Err(StoreError::Unavailable(format!(
            "unsupported store backend: {other}"
        ))),
    }
}
