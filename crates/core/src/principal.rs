//! Tenant and principal identity types.
//!
//! A principal is ephemeral: it is supplied per call by the caller's
//! role lookup and never persisted by the governance layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a tenant (a guild, workspace, or organisation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of the user a request is evaluated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A principal and the roles it holds within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub tenant: TenantId,
    pub id: PrincipalId,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Principal {
    pub fn new(tenant: &str, id: &str) -> Self {
        Self {
            tenant: TenantId::from(tenant),
            id: PrincipalId::from(id),
            roles: BTreeSet::new(),
        }
    }

    /// Add a role membership.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn holds(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}
