//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// HOTP bind/compare validation listener for slapd-sock delegation sockets
#[derive(Parser, Debug)]
#[command(name = "oath-sockd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OATH_SOCKD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Unix-domain socket path to listen on (overrides config)
    #[arg(short, long, env = "OATH_SOCKD_SOCKET")]
    pub socket_path: Option<String>,

    /// Number of concurrently handled requests (overrides config)
    #[arg(short, long, env = "OATH_SOCKD_WORKERS")]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "OATH_SOCKD_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OATH_SOCKD_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Attach diagnostic reason codes to rejection responses
    #[arg(long)]
    pub verbose_responses: bool,
}
