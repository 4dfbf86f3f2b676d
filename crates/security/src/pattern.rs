//! Model-reference patterns.
//!
//! A role grants access to models through patterns:
//! - `"*"` matches every model
//! - `"provider/*"` matches every model in the `provider/` namespace
//! - anything else must match exactly

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ModelPattern {
    /// Universal wildcard.
    Any,
    /// Namespace prefix including the trailing separator, e.g. `"openai/"`.
    Namespace(String),
    /// Exact model reference.
    Exact(String),
}

impl ModelPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            return Self::Any;
        }
        match pattern.strip_suffix("/*") {
            Some(namespace) => Self::Namespace(format!("{namespace}/")),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, model_ref: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Namespace(prefix) => model_ref.starts_with(prefix.as_str()),
            Self::Exact(exact) => model_ref == exact,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl From<String> for ModelPattern {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<ModelPattern> for String {
    fn from(p: ModelPattern) -> Self {
        p.to_string()
    }
}

impl std::fmt::Display for ModelPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Namespace(prefix) => write!(f, "{prefix}*"),
            Self::Exact(exact) => f.write_str(exact),
        }
    }
}
