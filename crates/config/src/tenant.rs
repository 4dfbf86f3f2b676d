//! Per-tenant policy configuration: enabled models, system prompts,
//! role policies, and rate/token limits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ConfigError, DefaultsConfig};

/// Role name that applies to every principal in a tenant.
pub const EVERYONE_ROLE: &str = "@everyone";

/// Configuration for a single tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Models enabled in this tenant, as `provider/model` references
    #[serde(default)]
    pub enabled_models: Vec<String>,

    #[serde(default)]
    pub default_model: String,

    /// Name of the system prompt used when none is requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_system_prompt: Option<String>,

    /// Override of `defaults.max_context_tokens`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,

    #[serde(default)]
    pub system_prompts: Vec<SystemPrompt>,

    #[serde(default)]
    pub rbac: RbacConfig,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub token_limits: TokenLimitsConfig,
}

/// A named system prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RbacConfig {
    /// Role policies, evaluated in order
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
}

/// Permissions and model access granted by one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Role identifier, or `@everyone`
    pub role: String,

    #[serde(default)]
    pub permissions: Vec<String>,

    /// Exact refs, `provider/*`, or `*`
    #[serde(default)]
    pub allowed_models: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub default: RateLimit,

    /// Per-role overrides keyed by role identifier
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub roles: HashMap<String, RateLimit>,
}

/// Request-rate limits. Zero means unlimited for that window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub requests_per_minute: u64,
    #[serde(default)]
    pub requests_per_hour: u64,
}

impl RateLimit {
    pub fn is_unlimited(&self) -> bool {
        self.requests_per_minute == 0 && self.requests_per_hour == 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenLimitsConfig {
    #[serde(default)]
    pub default: TokenLimit,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub roles: HashMap<String, TokenLimit>,
}

/// Token budget per fixed period. Zero tokens means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenLimit {
    #[serde(default)]
    pub bypass: bool,
    #[serde(default)]
    pub tokens_per_period: u64,
    #[serde(default = "default_period_hours")]
    pub period_hours: u64,
}

/// Longest accepted token period: ten years.
pub const MAX_PERIOD_HOURS: u64 = 24 * 366 * 10;

fn default_period_hours() -> u64 {
    24
}

impl Default for TokenLimit {
    fn default() -> Self {
        Self {
            bypass: false,
            tokens_per_period: 0,
            period_hours: default_period_hours(),
        }
    }
}

impl TokenLimit {
    pub fn bypassed() -> Self {
        Self {
            bypass: true,
            ..Self::default()
        }
    }

    /// Period length in seconds, clamped to `1..=MAX_PERIOD_HOURS` hours.
    pub fn period_secs(&self) -> u64 {
        self.period_hours.clamp(1, MAX_PERIOD_HOURS) * 3600
    }

    /// Whether the ledger must consult the store at all.
    pub fn is_enforced(&self) -> bool {
        !self.bypass && self.tokens_per_period > 0
    }
}

impl TenantConfig {
    /// Effective context window for this tenant.
    pub fn max_context_tokens(&self, defaults: &DefaultsConfig) -> usize {
        self.max_context_tokens
            .unwrap_or(defaults.max_context_tokens)
    }

    /// The default system prompt.
    ///
    /// Resolution order: the explicitly named default, the first prompt
    /// flagged `default = true`, then the first prompt.
    pub fn default_system_prompt(&self) -> Result<&str, ConfigError> {
        if let Some(name) = &self.default_system_prompt {
            return self.system_prompt(name);
        }

        self.system_prompts
            .iter()
            .find(|p| p.default)
            .or_else(|| self.system_prompts.first())
            .map(|p| p.content.as_str())
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "tenant {} has no system prompts configured",
                    self.id
                ))
            })
    }

    /// Look up a system prompt by name.
    pub fn system_prompt(&self, name: &str) -> Result<&str, ConfigError> {
        self.system_prompts
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.content.as_str())
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "system prompt '{name}' not found in tenant {}",
                    self.id
                ))
            })
    }

    pub(crate) fn validate(&self, index: usize, known_models: &[String]) -> Result<(), ConfigError> {
        let err = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.id.is_empty() {
            return err(format!("tenants[{index}].id is required"));
        }
        if self.enabled_models.is_empty() {
            return err(format!("tenants[{index}].enabled_models is required"));
        }
        if self.default_model.is_empty() {
            return err(format!("tenants[{index}].default_model is required"));
        }
        if let Some(unknown) = self
            .enabled_models
            .iter()
            .find(|m| !known_models.contains(m))
        {
            return err(format!(
                "tenants[{index}].enabled_models references unknown model: {unknown}"
            ));
        }
        if !self.enabled_models.contains(&self.default_model) {
            return err(format!(
                "tenants[{index}].default_model must be in enabled_models"
            ));
        }
        if self.system_prompts.is_empty() {
            return err(format!("tenants[{index}] must have at least one system prompt"));
        }
        if let Some(name) = &self.default_system_prompt {
            self.system_prompt(name)?;
        }
        if self.rbac.roles.is_empty() {
            return err(format!("tenants[{index}].rbac.roles is required"));
        }

        let token_limits = std::iter::once(&self.token_limits.default)
            .chain(self.token_limits.roles.values());
        for limit in token_limits {
            if limit.tokens_per_period > 0 && limit.period_hours == 0 {
                return err(format!(
                    "tenants[{index}] token limit with tokens_per_period > 0 needs period_hours > 0"
                ));
            }
            if limit.period_hours > MAX_PERIOD_HOURS {
                return err(format!(
                    "tenants[{index}] token limit period_hours exceeds {MAX_PERIOD_HOURS}"
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(name: &str, default: bool) -> SystemPrompt {
        SystemPrompt {
            name: name.into(),
            content: format!("You are {name}."),
            default,
        }
    }

    fn tenant(prompts: Vec<SystemPrompt>) -> TenantConfig {
        TenantConfig {
            id: "guild-1".into(),
            name: "Test".into(),
            enabled_models: vec!["ollama/llama3.2".into()],
            default_model: "ollama/llama3.2".into(),
            default_system_prompt: None,
            max_context_tokens: None,
            system_prompts: prompts,
            rbac: RbacConfig {
                roles: vec![RoleConfig {
                    role: EVERYONE_ROLE.into(),
                    permissions: vec!["use_models".into()],
                    allowed_models: vec!["*".into()],
                }],
            },
            rate_limits: RateLimitsConfig::default(),
            token_limits: TokenLimitsConfig::default(),
        }
    }

    #[test]
    fn flagged_default_prompt_wins_over_first() {
        let t = tenant(vec![prompt("plain", false), prompt("coder", true)]);
        assert_eq!(t.default_system_prompt().unwrap(), "You are coder.");
    }

    #[test]
    fn named_default_prompt_wins_over_flag() {
        let mut t = tenant(vec![prompt("plain", false), prompt("coder", true)]);
        t.default_system_prompt = Some("plain".into());
        assert_eq!(t.default_system_prompt().unwrap(), "You are plain.");
    }

    #[test]
    fn first_prompt_is_fallback() {
        let t = tenant(vec![prompt("plain", false), prompt("coder", false)]);
        assert_eq!(t.default_system_prompt().unwrap(), "You are plain.");
    }

    #[test]
    fn missing_named_prompt_is_error() {
        let t = tenant(vec![prompt("plain", false)]);
        assert!(t.system_prompt("pirate").is_err());
    }

    #[test]
    fn context_override_falls_back_to_defaults() {
        let mut t = tenant(vec![prompt("plain", true)]);
        let defaults = DefaultsConfig::default();
        assert_eq!(t.max_context_tokens(&defaults), defaults.max_context_tokens);
        t.max_context_tokens = Some(8192);
        assert_eq!(t.max_context_tokens(&defaults), 8192);
    }

    #[test]
    fn token_limit_defaults_and_period() {
        let limit = TokenLimit::default();
        assert_eq!(limit.period_hours, 24);
        assert_eq!(limit.period_secs(), 86_400);
        assert!(!limit.is_enforced());

        let zero_period = TokenLimit {
            bypass: false,
            tokens_per_period: 10,
            period_hours: 0,
        };
        assert_eq!(zero_period.period_secs(), 3600);
        assert!(!TokenLimit::bypassed().is_enforced());

        let huge_period = TokenLimit {
            period_hours: u64::MAX,
            ..zero_period
        };
        assert_eq!(huge_period.period_secs(), MAX_PERIOD_HOURS * 3600);
    }

    #[test]
    fn unknown_enabled_model_rejected() {
        let t = tenant(vec![prompt("plain", true)]);
        let err = t.validate(0, &["openai/gpt-4o".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown model"));
        assert!(t.validate(0, &["ollama/llama3.2".to_string()]).is_ok());
    }

    #[test]
    fn zero_period_with_limit_rejected() {
        let mut t = tenant(vec![prompt("plain", true)]);
        t.token_limits.default = TokenLimit {
            bypass: false,
            tokens_per_period: 1000,
            period_hours: 0,
        };
        assert!(t.validate(0, &["ollama/llama3.2".to_string()]).is_err());
    }

    #[test]
    fn oversized_period_rejected() {
        let mut t = tenant(vec![prompt("plain", true)]);
        t.token_limits.roles.insert(
            "pro".into(),
            TokenLimit {
                bypass: false,
                tokens_per_period: 1000,
                period_hours: u64::MAX,
            },
        );
        let err = t.validate(0, &["ollama/llama3.2".to_string()]).unwrap_err();
        assert!(err.to_string().contains("period_hours"));
    }
}
