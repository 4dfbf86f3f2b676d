//! Error types for the PromptGate domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all PromptGate operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Capability / policy errors ---
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    // --- Quota denials ---
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    // --- Shared counter store ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Which quota window produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    /// Short request-rate window.
    Minute,
    /// Long request-rate window.
    Hour,
    /// Token budget period.
    Token,
}

impl QuotaKind {
    /// Stable label, used in counter keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Token => "token",
        }
    }
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("No policy configured for tenant: {0}")]
    TenantNotFound(String),

    #[error("Model {model} is not permitted in tenant {tenant}")]
    ModelNotPermitted { tenant: String, model: String },

    #[error("Missing permission: {permission}")]
    PermissionDenied { permission: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    #[error("{kind} quota exceeded, retry after {retry_after_secs}s")]
    Exceeded {
        kind: QuotaKind,
        retry_after_secs: u64,
    },
}

/// Failures of the shared counter store.
///
/// Both variants are the "store unavailable" condition: the ledger never
/// turns them into an allow or a deny, the caller decides.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    #[error("Counter store returned a malformed result: {0}")]
    Malformed(String),
}
