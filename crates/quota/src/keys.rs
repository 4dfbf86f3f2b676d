//! Counter key layout.

use promptgate_core::{PrincipalId, QuotaKind, TenantId};

/// Builds namespaced counter keys:
///
/// - `{prefix}{tenant}:ratelimit:{principal}:{minute|hour}:{epoch_start}`
/// - `{prefix}{tenant}:tokens:{principal}:{period_start}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn rate(
        &self,
        tenant: &TenantId,
        principal: &PrincipalId,
        kind: QuotaKind,
        epoch_start: u64,
    ) -> String {
        format!(
            "{}{}:ratelimit:{}:{}:{}",
            self.prefix, tenant, principal, kind, epoch_start
        )
    }

    pub fn tokens(&self, tenant: &TenantId, principal: &PrincipalId, period_start: u64) -> String {
        format!("{}{}:tokens:{}:{}", self.prefix, tenant, principal, period_start)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("promptgate:")
    }
}
