//! `promptgate usage`: a principal's token usage in the configured store.

use promptgate_config::AppConfig;
use promptgate_core::Principal;
use promptgate_governor::Governor;

pub async fn run(
    config: &AppConfig,
    tenant: &str,
    principal: &str,
    roles: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let governor = Governor::from_config(config).await?;
    let principal = roles
        .iter()
        .fold(Principal::new(tenant, principal), |p, r| p.with_role(r.as_str()));

    let usage = governor.usage(&principal).await?;

    println!("📊 Token usage for {} in {}", principal.id, principal.tenant);
    println!("─────────────────────────────────────");
    println!("  Store:     {}", governor.ledger().store_name());
    if usage.limit == 0 {
        println!("  Used:      {} (unlimited)", usage.used);
    } else {
        let pct = usage.used as f64 / usage.limit as f64 * 100.0;
        println!("  Used:      {} / {} ({pct:.1}%)", usage.used, usage.limit);
        println!("  Remaining: {}", usage.remaining);
    }
    println!("  Resets in: {}s", usage.resets_in_secs);

    Ok(())
}
