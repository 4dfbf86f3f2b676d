//! Configuration loading, validation, and management for PromptGate.
//!
//! Loads configuration from `~/.promptgate/config.toml` (or the path in
//! `PROMPTGATE_CONFIG`) with environment variable overrides. Validates all
//! settings before a policy snapshot is built from them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod tenant;

pub use tenant::{
    EVERYONE_ROLE, MAX_PERIOD_HOURS, RateLimit, RateLimitsConfig, RbacConfig, RoleConfig, SystemPrompt,
    TenantConfig, TokenLimit, TokenLimitsConfig,
};

/// The root configuration structure.
///
/// Maps directly to `~/.promptgate/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Shared counter store
    #[serde(default)]
    pub store: StoreConfig,

    /// Defaults applied to every tenant
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Model providers and their models
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Per-tenant policy
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// "memory" or "sqlite"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Database path for the sqlite backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Prefix prepended to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_store_backend() -> String {
    "memory".into()
}
fn default_key_prefix() -> String {
    "promptgate:".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Tokens held back from the context budget for the model's reply
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,

    #[serde(default = "default_message_history_limit")]
    pub message_history_limit: usize,
}

fn default_max_context_tokens() -> usize {
    4096
}
fn default_reserve_tokens() -> usize {
    1000
}
fn default_message_history_limit() -> usize {
    50
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            reserve_tokens: default_reserve_tokens(),
            message_history_limit: default_message_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,
}

impl AppConfig {
    /// Load configuration from the default path.
    ///
    /// Environment overrides:
    /// - `PROMPTGATE_CONFIG`: config file path
    /// - `PROMPTGATE_STORE_PATH`: sqlite database path
    /// - `PROMPTGATE_LOG_LEVEL`: log level
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;

        if let Ok(path) = std::env::var("PROMPTGATE_STORE_PATH") {
            config.store.path = Some(path);
        }

        if let Ok(level) = std::env::var("PROMPTGATE_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        tracing::debug!(
            path = %path.display(),
            tenants = config.tenants.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".promptgate")
    }

    /// Config file path, honouring `PROMPTGATE_CONFIG`.
    pub fn config_path() -> PathBuf {
        std::env::var("PROMPTGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"))
    }

    /// Validate the configuration.
    ///
    /// An empty configuration (no providers, no tenants) is valid: it
    /// denies everything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.store.backend.as_str() {
            "memory" => {}
            "sqlite" => {
                if self.store.path.as_deref().is_none_or(str::is_empty) {
                    return Err(ConfigError::ValidationError(
                        "store.path is required for the sqlite backend".into(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown store.backend: {other} (expected \"memory\" or \"sqlite\")"
                )));
            }
        }

        if self.defaults.reserve_tokens >= self.defaults.max_context_tokens {
            tracing::warn!(
                reserve = self.defaults.reserve_tokens,
                max = self.defaults.max_context_tokens,
                "reserve_tokens leaves no room for context; only system prompts will be sent"
            );
        }

        for (i, provider) in self.providers.iter().enumerate() {
            if provider.name.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "providers[{i}].name is required"
                )));
            }
            if provider.models.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "providers[{i}] must have at least one model"
                )));
            }
            for (j, model) in provider.models.iter().enumerate() {
                if model.id.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "providers[{i}].models[{j}].id is required"
                    )));
                }
                if model.display_name.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "providers[{i}].models[{j}].display_name is required"
                    )));
                }
            }
        }

        let known_models = self.known_models();
        let mut seen = std::collections::HashSet::new();
        for (i, tenant) in self.tenants.iter().enumerate() {
            tenant.validate(i, &known_models)?;
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "tenants[{i}].id is duplicated: {}",
                    tenant.id
                )));
            }
        }

        Ok(())
    }

    /// Every `provider/model` reference the providers declare.
    pub fn known_models(&self) -> Vec<String> {
        self.providers
            .iter()
            .flat_map(|p| p.models.iter().map(move |m| format!("{}/{}", p.name, m.id)))
            .collect()
    }

    /// Look up a tenant by id.
    pub fn tenant(&self, id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == id)
    }

    /// Resolve a `provider/model` reference.
    pub fn resolve_model(
        &self,
        model_ref: &str,
    ) -> Result<(&ProviderConfig, &ModelConfig), ConfigError> {
        let (provider_name, model_id) = model_ref
            .split_once('/')
            .filter(|(p, m)| !p.is_empty() && !m.is_empty())
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "invalid model reference: {model_ref} (expected format: provider/model)"
                ))
            })?;

        let provider = self
            .providers
            .iter()
            .find(|p| p.name == provider_name)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!("provider {provider_name} not found"))
            })?;

        let model = provider
            .models
            .iter()
            .find(|m| m.id == model_id)
            .ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "model {model_id} not found in provider {provider_name}"
                ))
            })?;

        Ok((provider, model))
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[store]
backend = "memory"
key_prefix = "test:"

[defaults]
max_context_tokens = 4096
reserve_tokens = 1000

[[providers]]
name = "ollama"
[[providers.models]]
id = "llama3.2"
display_name = "Llama 3.2"
context_window = 8192

[[providers]]
name = "openai"
[[providers.models]]
id = "gpt-4o"
display_name = "GPT-4o"
[[providers.models]]
id = "gpt-4o-mini"
display_name = "GPT-4o Mini"

[[tenants]]
id = "guild-1"
name = "Test Guild"
enabled_models = ["ollama/llama3.2", "openai/gpt-4o", "openai/gpt-4o-mini"]
default_model = "ollama/llama3.2"
max_context_tokens = 8192

[[tenants.system_prompts]]
name = "helpful"
content = "You are a helpful assistant."
default = true

[[tenants.rbac.roles]]
role = "Admin"
permissions = ["use_models", "manage_prompts", "unlimited_tokens"]
allowed_models = ["*"]

[[tenants.rbac.roles]]
role = "@everyone"
permissions = ["use_models"]
allowed_models = ["ollama/*"]

[tenants.rate_limits.default]
requests_per_minute = 3
requests_per_hour = 10

[tenants.rate_limits.roles.Admin]
requests_per_minute = 0
requests_per_hour = 0

[tenants.token_limits.default]
tokens_per_period = 100000
period_hours = 24

[tenants.token_limits.roles.Admin]
bypass = true
"#;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.store.key_prefix, "promptgate:");
        assert_eq!(config.defaults.max_context_tokens, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn sample_config_parses() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.providers.len(), 2);
        let tenant = config.tenant("guild-1").unwrap();
        assert_eq!(tenant.rbac.roles.len(), 2);
        assert_eq!(tenant.rate_limits.default.requests_per_minute, 3);
        assert!(tenant.rate_limits.roles["Admin"].is_unlimited());
        assert!(tenant.token_limits.roles["Admin"].bypass);
        assert_eq!(tenant.token_limits.roles["Admin"].period_hours, 24);
        assert_eq!(tenant.max_context_tokens(&config.defaults), 8192);
        assert!(config.tenant("missing").is_none());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = AppConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.tenants.len(), 1);
        assert_eq!(parsed.known_models(), config.known_models());
    }

    #[test]
    fn resolve_model_reference() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let (provider, model) = config.resolve_model("ollama/llama3.2").unwrap();
        assert_eq!(provider.name, "ollama");
        assert_eq!(model.context_window, Some(8192));

        assert!(config.resolve_model("llama3.2").is_err());
        assert!(config.resolve_model("ollama/").is_err());
        assert!(config.resolve_model("anthropic/claude").is_err());
    }

    #[test]
    fn sqlite_backend_requires_path() {
        let mut config = AppConfig::default();
        config.store.backend = "sqlite".into();
        assert!(config.validate().is_err());
        config.store.path = Some("/tmp/promptgate.db".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = AppConfig::default();
        config.store.backend = "etcd".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("etcd"));
    }

    #[test]
    fn default_model_must_be_enabled() {
        let broken = SAMPLE.replace(
            "default_model = \"ollama/llama3.2\"",
            "default_model = \"openai/gpt-4o-mini-2\"",
        );
        assert!(AppConfig::from_toml_str(&broken).is_err());
    }

    #[test]
    fn duplicate_tenant_rejected() {
        let mut config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let dup = config.tenants[0].clone();
        config.tenants.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicated"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        let config = result.unwrap();
        assert!(config.tenants.is_empty());
    }

    #[test]
    fn load_from_file_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[store\nbackend = 1").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.store.key_prefix, "test:");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("promptgate:"));
        assert!(toml_str.contains("4096"));
    }
}
