//! CLI surface: `run` and `migrate`, via `clap::Parser` over an
//! `Option<Command>` that defaults to serving when no subcommand is
//! given.

use clap::{Parser, Subcommand};

use warden_domain::config::Config;

/// warden — multi-tenant bot-supervisor core.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the control-plane RPC server and the supervisor (default).
    Run,
    /// Prepare persistent state. Not part of the core: the relational
    /// config store is an external collaborator, so this has nothing
    /// of its own to migrate.
    Migrate,
}

/// Load configuration from the path named by `WARDEN_CONFIG` (default
/// `warden.toml`), then apply environment overrides. Missing file is
/// not an error — defaults are used.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let config_path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "warden.toml".into());
    let path = std::path::Path::new(&config_path);
    let config = Config::load(Some(path)).map_err(|e| anyhow::anyhow!("{config_path}: {e}"))?;
    Ok((config, config_path))
}
