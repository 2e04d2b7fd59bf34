//! # CLI Interface
//!
//! Command-line argument structure for `weave-node` using `clap` derive.
//! Two subcommands: `run` starts the console with one or more hosted
//! peers, `version` prints build information.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// WEAVE console node.
///
/// Hosts fabric peers and the operator command surface: chat, remote
/// execution, queries, and standing observations over the peer-to-peer
/// auto-discovery fabric.
#[derive(Parser, Debug)]
#[command(
    name = "weave-node",
    about = "WEAVE fabric console node",
    version,
    propagate_version = true
)]
pub struct WeaveNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the WEAVE node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the console and enter the fabric.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Server prefix for canonical peer names (`<server>_<character>`).
    #[arg(long, short = 's', env = "WEAVE_SERVER", default_value = "local")]
    pub server: String,

    /// Character names to host on the in-process fabric, comma-separated.
    ///
    /// Every named peer enters the same fabric, so a single console can
    /// exercise whispers, shouts, queries, and observations end to end.
    #[arg(long, short = 'p', value_delimiter = ',', default_value = "alice,bob")]
    pub peers: Vec<String>,

    /// Path to the persisted settings file (TOML).
    #[arg(long, short = 'c', env = "WEAVE_CONFIG", default_value = "weave.toml")]
    pub config: PathBuf,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Host tick interval in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub tick_ms: u64,
}

/// Validates a log level string against the levels tracing understands.
pub fn validate_log_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error")
}
