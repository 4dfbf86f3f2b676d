//! PromptGate CLI, the operator's view of the governance layer.
//!
//! Commands:
//! - `config`   Validate, show, or locate the configuration
//! - `resolve`  Effective permissions and models for a set of roles
//! - `tokens`   Count tokens for a model
//! - `usage`    Token usage of one principal in the configured store

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use promptgate_config::LoggingConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "promptgate",
    about = "PromptGate: quotas, capabilities, and context budgets for model access",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.promptgate/config.toml)
    #[arg(short, long, global = true, env = "PROMPTGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show what a principal holding the given roles may do
    Resolve {
        #[arg(short, long)]
        tenant: String,

        /// Role held by the principal (repeatable)
        #[arg(short, long = "role")]
        roles: Vec<String>,
    },

    /// Count tokens in a piece of text
    Tokens {
        /// Model reference used to pick the encoding
        #[arg(short, long)]
        model: String,

        text: String,
    },

    /// Show a principal's token usage for the current period
    Usage {
        #[arg(short, long)]
        tenant: String,

        #[arg(short, long)]
        principal: String,

        #[arg(short, long = "role")]
        roles: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Parse and validate the configuration
    Validate,
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

fn init_logging(verbose: bool, logging: &LoggingConfig) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let loaded = commands::load_config(cli.config.as_deref());
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_logging(cli.verbose, &logging);

    match cli.command {
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate(loaded)?,
            ConfigAction::Show => commands::config_cmd::show(&loaded?)?,
            ConfigAction::Path => commands::config_cmd::path(cli.config.as_deref()),
        },
        Commands::Resolve { tenant, roles } => commands::resolve::run(&loaded?, &tenant, &roles)?,
        Commands::Tokens { model, text } => commands::tokens::run(&model, &text),
        Commands::Usage {
            tenant,
            principal,
            roles,
        } => commands::usage::run(&loaded?, &tenant, &principal, &roles).await?,
    }

    Ok(())
}
