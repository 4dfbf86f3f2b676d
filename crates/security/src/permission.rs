//! Known permission names.
//!
//! Permissions are flat strings in configuration. The names the
//! governance layer itself acts on are listed here; any other string is
//! still carried through resolution untouched.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Invoke models at all
    UseModels,
    /// Create and delete system prompts
    ManagePrompts,
    /// Change model configuration
    ManageModels,
    /// Skip request-rate quotas
    UnlimitedRate,
    /// Skip token quotas
    UnlimitedTokens,
    /// Read other principals' usage
    ViewAllUsage,
    /// Swap the policy snapshot
    ReloadConfig,
}

impl Permission {
    pub const ALL: [Permission; 7] = [
        Self::UseModels,
        Self::ManagePrompts,
        Self::ManageModels,
        Self::UnlimitedRate,
        Self::UnlimitedTokens,
        Self::ViewAllUsage,
        Self::ReloadConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseModels => "use_models",
            Self::ManagePrompts => "manage_prompts",
            Self::ManageModels => "manage_models",
            Self::UnlimitedRate => "unlimited_rate",
            Self::UnlimitedTokens => "unlimited_tokens",
            Self::ViewAllUsage => "view_all_usage",
            Self::ReloadConfig => "reload_config",
        }
    }

    /// Whether `name` is one of the known permission names.
    pub fn is_known(name: &str) -> bool {
        name.parse::<Self>().is_ok()
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission: {s}"))
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
