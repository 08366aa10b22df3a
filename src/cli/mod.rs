//! CLI argument definitions for `gt`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Version string with the commit and build time recorded by `build.rs`.
pub const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GT_GIT_COMMIT"),
    " ",
    env!("GT_BUILD_TIMESTAMP"),
    ")"
);

/// Gas Town dashboard - live status and consistency checks for a town of agents.
#[derive(Parser, Debug)]
#[command(name = "gt")]
#[command(author, version = VERSION, about = "Live status dashboard and doctor for a Gas Town", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Town root directory. Defaults to the nearest ancestor containing
    /// mayor/town.kdl, then the current directory.
    #[arg(long = "town", global = true, env = "GT_TOWN_ROOT")]
    pub town_root: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the dashboard API and live update channel
    #[cfg(feature = "web")]
    Serve {
        /// Address to bind (overrides GT_HOST and town.kdl)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides GT_PORT and town.kdl)
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds between change-detection polls (minimum 1)
        #[arg(long = "poll-interval", value_name = "SECS")]
        poll_interval: Option<u64>,

        /// Development mode: allow cross-origin requests from any origin
        #[arg(long)]
        dev: bool,
    },

    /// Show a snapshot of the town
    Status {
        /// Skip per-agent mail counts
        #[arg(long)]
        fast: bool,
    },

    /// Check bead stores for invariant violations
    Doctor {
        /// Repair what the checks find
        #[arg(long)]
        fix: bool,

        /// Run only the named check (e.g. hook-singleton)
        #[arg(long, value_name = "NAME")]
        check: Option<String>,
    },
}
