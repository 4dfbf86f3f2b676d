//! Capability resolution: role memberships to effective grants.
//!
//! A principal receives the union of every role policy it holds plus the
//! `@everyone` policy. Resolution never fails: an unknown tenant resolves to
//! empty capabilities, which deny everything.

use std::collections::BTreeSet;
use std::sync::Arc;

use promptgate_core::TenantId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pattern::ModelPattern;
use crate::permission::Permission;
use crate::snapshot::{PolicyStore, RolePolicy};

/// Effective allowed-model set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedModels {
    /// Every model the tenant has enabled.
    All,
    Patterns(Vec<ModelPattern>),
}

impl Default for AllowedModels {
    fn default() -> Self {
        Self::Patterns(Vec::new())
    }
}

impl AllowedModels {
    pub fn matches(&self, model_ref: &str) -> bool {
        match self {
            Self::All => true,
            Self::Patterns(patterns) => patterns.iter().any(|p| p.matches(model_ref)),
        }
    }
}

/// What a principal may do within one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub permissions: BTreeSet<String>,
    pub allowed: AllowedModels,
    /// The tenant's enabled models, in configured order.
    pub enabled_models: Vec<String>,
}

impl Capabilities {
    /// Capabilities that grant nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.allowed == AllowedModels::default()
    }

    pub fn has_permission(&self, name: &str) -> bool {
        self.permissions.contains(name)
    }

    pub fn has(&self, permission: Permission) -> bool {
        self.has_permission(permission.as_str())
    }

    /// Whether `model_ref` is both enabled in the tenant and granted.
    pub fn can_use_model(&self, model_ref: &str) -> bool {
        self.enabled_models.iter().any(|m| m == model_ref) && self.allowed.matches(model_ref)
    }

    /// Enabled models the principal may use, in tenant order.
    pub fn allowed_models_list(&self) -> Vec<String> {
        self.enabled_models
            .iter()
            .filter(|m| self.allowed.matches(m))
            .cloned()
            .collect()
    }
}

/// Resolve capabilities from an explicit, ordered policy list.
pub fn resolve_roles(
    policies: &[RolePolicy],
    enabled_models: &[String],
    roles: &BTreeSet<String>,
) -> Capabilities {
    let mut permissions = BTreeSet::new();
    let mut patterns: Vec<ModelPattern> = Vec::new();
    let mut all = false;

    for policy in policies.iter().filter(|p| p.applies_to(roles)) {
        permissions.extend(policy.permissions.iter().cloned());
        if all {
            continue;
        }
        for pattern in &policy.allowed_models {
            if pattern.is_any() {
                all = true;
                break;
            }
            if !patterns.contains(pattern) {
                patterns.push(pattern.clone());
            }
        }
    }

    Capabilities {
        permissions,
        allowed: if all {
            AllowedModels::All
        } else {
            AllowedModels::Patterns(patterns)
        },
        enabled_models: enabled_models.to_vec(),
    }
}

/// Resolves capabilities against the current policy snapshot.
#[derive(Debug, Clone)]
pub struct CapabilityResolver {
    policies: Arc<PolicyStore>,
}

impl CapabilityResolver {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self { policies }
    }

    pub fn resolve(&self, tenant: &TenantId, roles: &BTreeSet<String>) -> Capabilities {
        let snapshot = self.policies.current();
        let Some(policy) = snapshot.tenant(tenant) else {
            debug!(tenant = %tenant, "No policy for tenant, resolving empty capabilities");
            return Capabilities::empty();
        };

        let caps = resolve_roles(&policy.roles, &policy.enabled_models, roles);
        debug!(
            tenant = %tenant,
            version = snapshot.version,
            permissions = caps.permissions.len(),
            all_models = matches!(caps.allowed, AllowedModels::All),
            "Resolved capabilities"
        );
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{PolicySnapshot, TenantPolicy};
    use promptgate_config::{EVERYONE_ROLE, RateLimit, TokenLimit};

    fn roles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn enabled() -> Vec<String> {
        ["p/x", "p/y", "q/x", "q/z"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn policies() -> Vec<RolePolicy> {
        vec![
            RolePolicy::new(EVERYONE_ROLE)
                .with_permission("use_models")
                .with_model("p/*"),
            RolePolicy::new("mod")
                .with_permission("manage_prompts")
                .with_model("q/x"),
            RolePolicy::new("admin")
                .with_permission("reload_config")
                .with_model("*"),
        ]
    }

    #[test]
    fn everyone_policy_applies_without_roles() {
        let caps = resolve_roles(&policies(), &enabled(), &roles(&[]));
        assert!(caps.has(Permission::UseModels));
        assert!(!caps.has(Permission::ManagePrompts));
        assert_eq!(caps.allowed_models_list(), vec!["p/x", "p/y"]);
    }

    #[test]
    fn namespace_pattern_scopes_to_provider() {
        let caps = resolve_roles(&policies(), &enabled(), &roles(&[]));
        assert!(caps.can_use_model("p/x"));
        assert!(caps.can_use_model("p/y"));
        assert!(!caps.can_use_model("q/x"));
    }

    #[test]
    fn multiple_roles_receive_union() {
        let caps = resolve_roles(&policies(), &enabled(), &roles(&["mod"]));
        assert!(caps.has(Permission::UseModels));
        assert!(caps.has(Permission::ManagePrompts));
        assert_eq!(caps.allowed_models_list(), vec!["p/x", "p/y", "q/x"]);
        assert!(!caps.can_use_model("q/z"));
    }

    #[test]
    fn wildcard_grants_every_enabled_model() {
        let caps = resolve_roles(&policies(), &enabled(), &roles(&["admin"]));
        assert_eq!(caps.allowed, AllowedModels::All);
        assert_eq!(caps.allowed_models_list(), enabled());
        // Still bounded by what the tenant enabled.
        assert!(!caps.can_use_model("r/unlisted"));
    }

    #[test]
    fn unknown_permission_names_pass_through() {
        let policies = vec![RolePolicy::new("dj").with_permission("queue_music")];
        let caps = resolve_roles(&policies, &enabled(), &roles(&["dj"]));
        assert!(caps.has_permission("queue_music"));
        assert!(caps.allowed_models_list().is_empty());
    }

    #[test]
    fn unheld_roles_grant_nothing() {
        let policies = vec![RolePolicy::new("admin").with_model("*")];
        let caps = resolve_roles(&policies, &enabled(), &roles(&["member"]));
        assert!(caps.permissions.is_empty());
        assert!(!caps.can_use_model("p/x"));
    }

    fn store() -> Arc<PolicyStore> {
        let tenant = TenantPolicy {
            id: TenantId::from("guild-1"),
            enabled_models: enabled(),
            default_model: "p/x".into(),
            roles: policies(),
            default_rate: RateLimit::default(),
            default_tokens: TokenLimit::default(),
            max_context_tokens: 4096,
            reserve_tokens: 1000,
            default_system_prompt: None,
        };
        Arc::new(PolicyStore::new(PolicySnapshot::new(1, vec![tenant])))
    }

    #[test]
    fn resolver_reads_current_snapshot() {
        let resolver = CapabilityResolver::new(store());
        let caps = resolver.resolve(&TenantId::from("guild-1"), &roles(&["mod"]));
        assert!(caps.can_use_model("q/x"));
    }

    #[test]
    fn unknown_tenant_resolves_empty() {
        let resolver = CapabilityResolver::new(store());
        let caps = resolver.resolve(&TenantId::from("nope"), &roles(&["admin"]));
        assert!(caps.is_empty());
        assert!(!caps.has(Permission::UseModels));
        assert!(caps.allowed_models_list().is_empty());
    }

    #[test]
    fn resolver_sees_swapped_snapshot() {
        let store = store();
        let resolver = CapabilityResolver::new(store.clone());
        store.swap(PolicySnapshot::new(2, Vec::new()));
        let caps = resolver.resolve(&TenantId::from("guild-1"), &roles(&[]));
        assert!(caps.is_empty());
    }
}
