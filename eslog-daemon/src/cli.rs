//! CLI argument definitions for eslog-daemon.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Docker logging plugin that ships container logs to Elasticsearch.
///
/// Listens on the plugin unix socket, runs one ingestion pipeline per
/// container log stream and flushes every stream on shutdown.
#[derive(Parser, Debug)]
#[command(name = "eslog-daemon")]
#[command(version, about, long_about = None)]
pub struct DaemonCli {
    /// Path to eslog.toml configuration file.
    #[arg(short, long, default_value = "/etc/eslog/eslog.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Override the plugin socket path.
    #[arg(long)]
    pub socket: Option<String>,

    /// Validate configuration file and exit without starting the daemon.
    #[arg(long)]
    pub validate: bool,
}
