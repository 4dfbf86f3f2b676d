//! `promptgate resolve`: effective capabilities and limits for a role set.

use std::collections::BTreeSet;
use std::sync::Arc;

use promptgate_config::AppConfig;
use promptgate_core::TenantId;
use promptgate_security::{
    AllowedModels, Capabilities, CapabilityResolver, PolicyStore, TenantPolicy,
};

pub fn run(
    config: &AppConfig,
    tenant: &str,
    roles: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let policies = Arc::new(PolicyStore::from_config(config));
    let resolver = CapabilityResolver::new(policies.clone());
    let tenant_id = TenantId::from(tenant);
    let roles: BTreeSet<String> = roles.iter().cloned().collect();

    let snapshot = policies.current();
    let Some(policy) = snapshot.tenant(&tenant_id) else {
        return Err(format!("No policy configured for tenant: {tenant}").into());
    };
    let caps = resolver.resolve(&tenant_id, &roles);

    println!("🔐 Capabilities in {tenant}");
    println!("─────────────────────────────────────");
    if caps.permissions.is_empty() {
        println!("  Permissions: (none)");
    } else {
        println!("  Permissions:");
        for perm in &caps.permissions {
            println!("    • {perm}");
        }
    }

    let scope = match &caps.allowed {
        AllowedModels::All => "all enabled".to_string(),
        AllowedModels::Patterns(p) => format!("{} pattern(s)", p.len()),
    };
    println!("  Models ({scope}):");
    let allowed = caps.allowed_models_list();
    if allowed.is_empty() {
        println!("    (none)");
    }
    for model in &allowed {
        let marker = if *model == policy.default_model { " (default)" } else { "" };
        println!("    • {model}{marker}");
    }

    println!();
    for line in limit_lines(&policy, &caps, &roles) {
        println!("  {line}");
    }

    Ok(())
}

/// Limits as `admit` enforces them, permission bypasses included.
fn limit_lines(policy: &TenantPolicy, caps: &Capabilities, roles: &BTreeSet<String>) -> Vec<String> {
    let rate = policy.effective_rate_limit(caps, roles);
    let tokens = policy.effective_token_limit(caps, roles);
    let tokens = if tokens.is_enforced() {
        format!("Tokens: {} per {}h", tokens.tokens_per_period, tokens.period_hours)
    } else {
        "Tokens: unlimited".to_string()
    };
    vec![
        format!(
            "Rate:   {} / minute, {} / hour",
            limit(rate.requests_per_minute),
            limit(rate.requests_per_hour)
        ),
        tokens,
        format!(
            "Context: {} tokens ({} reserved)",
            policy.max_context_tokens, policy.reserve_tokens
        ),
    ]
}

fn limit(value: u64) -> String {
    if value == 0 {
        "unlimited".into()
    } else {
        value.to_string()
    }
}
