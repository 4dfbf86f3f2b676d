//! Immutable policy snapshots and the swappable store that holds them.
//!
//! A `PolicySnapshot` is built once from configuration and never mutated.
//! Reloading builds a new snapshot and swaps the `Arc` under a short write
//! lock; an evaluation that already cloned the old `Arc` keeps seeing it in
//! full.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use promptgate_config::{AppConfig, EVERYONE_ROLE, RateLimit, TenantConfig, TokenLimit};
use promptgate_core::TenantId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capability::Capabilities;
use crate::pattern::ModelPattern;
use crate::permission::Permission;

/// Grants and limit overrides attached to one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePolicy {
    pub role: String,
    pub permissions: BTreeSet<String>,
    pub allowed_models: Vec<ModelPattern>,
    pub rate_limit: Option<RateLimit>,
    pub token_limit: Option<TokenLimit>,
}

impl RolePolicy {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            permissions: BTreeSet::new(),
            allowed_models: Vec::new(),
            rate_limit: None,
            token_limit: None,
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_model(mut self, pattern: &str) -> Self {
        self.allowed_models.push(ModelPattern::parse(pattern));
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_token_limit(mut self, limit: TokenLimit) -> Self {
        self.token_limit = Some(limit);
        self
    }

    /// Whether this policy applies to a principal holding `roles`.
    pub fn applies_to(&self, roles: &BTreeSet<String>) -> bool {
        self.role == EVERYONE_ROLE || roles.contains(&self.role)
    }
}

/// Everything the governance layer needs to know about one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub id: TenantId,
    /// Enabled model references, in configured order.
    pub enabled_models: Vec<String>,
    pub default_model: String,
    /// Role policies, in configured order.
    pub roles: Vec<RolePolicy>,
    pub default_rate: RateLimit,
    pub default_tokens: TokenLimit,
    pub max_context_tokens: usize,
    pub reserve_tokens: usize,
    pub default_system_prompt: Option<String>,
}

impl TenantPolicy {
    fn from_config(tenant: &TenantConfig, config: &AppConfig) -> Self {
        let roles = tenant
            .rbac
            .roles
            .iter()
            .map(|role| {
                for perm in role.permissions.iter().filter(|p| !Permission::is_known(p)) {
                    warn!(
                        tenant = %tenant.id,
                        role = %role.role,
                        permission = %perm,
                        "Unknown permission name in role policy"
                    );
                }
                RolePolicy {
                    role: role.role.clone(),
                    permissions: role.permissions.iter().cloned().collect(),
                    allowed_models: role
                        .allowed_models
                        .iter()
                        .map(|p| ModelPattern::parse(p))
                        .collect(),
                    rate_limit: tenant.rate_limits.roles.get(&role.role).copied(),
                    token_limit: tenant.token_limits.roles.get(&role.role).copied(),
                }
            })
            .collect();

        Self {
            id: TenantId::from(tenant.id.as_str()),
            enabled_models: tenant.enabled_models.clone(),
            default_model: tenant.default_model.clone(),
            roles,
            default_rate: tenant.rate_limits.default,
            default_tokens: tenant.token_limits.default,
            max_context_tokens: tenant.max_context_tokens(&config.defaults),
            reserve_tokens: config.defaults.reserve_tokens,
            default_system_prompt: tenant.default_system_prompt().ok().map(str::to_string),
        }
    }

    /// Rate limit of the first applicable role carrying an override,
    /// otherwise the tenant default.
    pub fn rate_limit_for(&self, roles: &BTreeSet<String>) -> RateLimit {
        self.roles
            .iter()
            .filter(|p| p.applies_to(roles))
            .find_map(|p| p.rate_limit)
            .unwrap_or(self.default_rate)
    }

    /// Token limit of the first applicable role carrying an override,
    /// otherwise the tenant default.
    pub fn token_limit_for(&self, roles: &BTreeSet<String>) -> TokenLimit {
        self.roles
            .iter()
            .filter(|p| p.applies_to(roles))
            .find_map(|p| p.token_limit)
            .unwrap_or(self.default_tokens)
    }

    /// Rate limit as enforced: unlimited when `caps` grants `unlimited_rate`.
    pub fn effective_rate_limit(&self, caps: &Capabilities, roles: &BTreeSet<String>) -> RateLimit {
        if caps.has(Permission::UnlimitedRate) {
            RateLimit::default()
        } else {
            self.rate_limit_for(roles)
        }
    }

    /// Token limit as enforced: bypassed when `caps` grants `unlimited_tokens`.
    pub fn effective_token_limit(&self, caps: &Capabilities, roles: &BTreeSet<String>) -> TokenLimit {
        if caps.has(Permission::UnlimitedTokens) {
            TokenLimit::bypassed()
        } else {
            self.token_limit_for(roles)
        }
    }
}

/// A complete, versioned set of tenant policies.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    pub version: u64,
    tenants: HashMap<TenantId, Arc<TenantPolicy>>,
}

impl PolicySnapshot {
    pub fn new(version: u64, tenants: impl IntoIterator<Item = TenantPolicy>) -> Self {
        Self {
            version,
            tenants: tenants
                .into_iter()
                .map(|t| (t.id.clone(), Arc::new(t)))
                .collect(),
        }
    }

    pub fn from_config(config: &AppConfig, version: u64) -> Self {
        Self::new(
            version,
            config
                .tenants
                .iter()
                .map(|t| TenantPolicy::from_config(t, config)),
        )
    }

    pub fn tenant(&self, id: &TenantId) -> Option<Arc<TenantPolicy>> {
        self.tenants.get(id).cloned()
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }
}

/// Holder of the current snapshot.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(PolicySnapshot::from_config(config, 1))
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.current().version
    }

    /// Replace the snapshot, returning the one it replaced.
    pub fn swap(&self, snapshot: PolicySnapshot) -> Arc<PolicySnapshot> {
        let next = Arc::new(snapshot);
        let to = next.version;
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, next);
        drop(guard);
        info!(from = previous.version, to, "Policy snapshot swapped");
        previous
    }

    /// Build a snapshot from `config` with the next version number and swap
    /// it in. Returns the new version.
    ///
    /// The version is read and the snapshot published under one write
    /// guard, so concurrent reloads get distinct versions.
    pub fn reload(&self, config: &AppConfig) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let from = guard.version;
        let version = from + 1;
        *guard = Arc::new(PolicySnapshot::from_config(config, version));
        drop(guard);
        info!(from, to = version, "Policy snapshot reloaded");
        version
    }
}
