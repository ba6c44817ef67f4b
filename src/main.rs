//! oomwatch - OOM detection state tool
//!
//! Reads the same state directory an instrumented application writes to and
//! reports what its next start would decide.

mod cli;
mod commands;

use anyhow::Context;

use oomwatch_app::config::load_config_from;
use oomwatch_app::{load_config, OomConfig};

use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = resolve_config(&cli)?;
    let stdout = std::io::stdout();
    commands::run(&cli.command, &config, &mut stdout.lock())
}

/// Load the config file and apply command-line overrides
fn resolve_config(cli: &Cli) -> anyhow::Result<OomConfig> {
    let mut config = match cli.config {
        Some(ref path) => load_config_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_config().unwrap_or_else(|e| {
            log::warn!("Using default config: {}", e);
            OomConfig::default()
        }),
    };

    if let Some(ref dir) = cli.state_dir {
        config.state_dir = Some(dir.clone());
    }

    Ok(config)
}
