//! CLI argument parsing for oomwatch

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// oomwatch - Inspect and administer OOM detection state
#[derive(Parser, Debug)]
#[command(name = "oomwatch")]
#[command(about = "Inspect and administer OOM detection state")]
#[command(version)]
pub struct Cli {
    /// Config file (default: platform config directory)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// State directory, overrides the config file
    #[arg(short = 's', long = "state-dir")]
    pub state_dir: Option<PathBuf>,

    /// Log level
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show the stored state and what the next start would decide
    Status,
    /// Disable OOM detection until re-enabled
    Disable,
    /// Re-enable OOM detection
    Enable,
    /// Remove the stored session state
    Clear {
        /// Also drop reports awaiting upload confirmation
        #[arg(long)]
        pending: bool,
    },
    /// Print the bundle a report of the stored state would contain
    Bundle,
}
