pub mod config_cmd;
pub mod resolve;
pub mod tokens;
pub mod usage;

use std::path::Path;

use promptgate_config::{AppConfig, ConfigError};

/// Load configuration from `path`, or from the default location.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => {
            let config = AppConfig::load_from(path)?;
            config.validate()?;
            Ok(config)
        }
        None => AppConfig::load(),
    }
}
