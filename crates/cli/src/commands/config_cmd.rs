//! `promptgate config`: configuration management commands.

use std::path::Path;

use promptgate_config::{AppConfig, ConfigError};
use promptgate_security::Permission;

pub fn validate(loaded: Result<AppConfig, ConfigError>) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 Validating configuration...");

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            println!("   ❌ Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   ✅ Config parsed successfully");

    let warnings = warnings(&config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Store:     {}", config.store.backend);
    println!("   Providers: {}", config.providers.len());
    println!("   Models:    {}", config.known_models().len());
    println!("   Tenants:   {}", config.tenants.len());
    println!(
        "   Context:   {} tokens ({} reserved)",
        config.defaults.max_context_tokens, config.defaults.reserve_tokens
    );

    Ok(())
}

/// Non-fatal findings: valid, but probably not what the operator meant.
pub fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.defaults.reserve_tokens >= config.defaults.max_context_tokens {
        warnings.push(format!(
            "reserve_tokens ({}) leaves no room in max_context_tokens ({})",
            config.defaults.reserve_tokens, config.defaults.max_context_tokens
        ));
    }

    for tenant in &config.tenants {
        for role in &tenant.rbac.roles {
            for perm in role.permissions.iter().filter(|p| !Permission::is_known(p)) {
                warnings.push(format!(
                    "tenant {}: role {} grants unknown permission '{perm}'",
                    tenant.id, role.role
                ));
            }
        }

        let referenced = tenant
            .rate_limits
            .roles
            .keys()
            .chain(tenant.token_limits.roles.keys());
        for role in referenced {
            if !tenant.rbac.roles.iter().any(|r| &r.role == role) {
                warnings.push(format!(
                    "tenant {}: limit override for role {role} which has no RBAC policy",
                    tenant.id
                ));
            }
        }
    }

    warnings
}

pub fn show(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path(explicit: Option<&Path>) {
    match explicit {
        Some(path) => println!("{}", path.display()),
        None => println!("{}", AppConfig::config_path().display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[[providers]]
name = "ollama"
[[providers.models]]
id = "llama3.2"
display_name = "Llama 3.2"

[[tenants]]
id = "guild-1"
enabled_models = ["ollama/llama3.2"]
default_model = "ollama/llama3.2"

[[tenants.system_prompts]]
name = "plain"
content = "Be brief."

[[tenants.rbac.roles]]
role = "@everyone"
permissions = ["use_models", "fly"]
allowed_models = ["*"]

[tenants.rate_limits.roles.ghost]
requests_per_minute = 1
"#;

    #[test]
    fn warns_on_unknown_permission_and_orphan_override() {
        let config = AppConfig::from_toml_str(CONFIG).unwrap();
        let warnings = warnings(&config);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("'fly'"));
        assert!(warnings[1].contains("ghost"));
    }

    #[test]
    fn default_config_has_no_warnings() {
        assert!(warnings(&AppConfig::default()).is_empty());
    }

    #[test]
    fn validate_reports_load_error() {
        let err = ConfigError::ValidationError("broken".into());
        assert!(validate(Err(err)).is_err());
    }

    #[test]
    fn load_config_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, CONFIG).unwrap();
        let config = crate::commands::load_config(Some(&path)).unwrap();
        assert_eq!(config.tenants.len(), 1);
        assert!(validate(Ok(config)).is_ok());
    }

    #[test]
    fn load_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store]\nbackend = \"sqlite\"\n").unwrap();
        assert!(crate::commands::load_config(Some(&path)).is_err());
    }
}
