//! Command-line interface

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Cached, rate-limited front for a mentor directory upstream
#[derive(Parser, Debug)]
#[command(name = "mentor-shield")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MENTOR_SHIELD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MENTOR_SHIELD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MENTOR_SHIELD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "MENTOR_SHIELD_METRICS_ADDR", global = true)]
    pub metrics_addr: Option<SocketAddr>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Populate the cache once and report what was loaded
    Warm,

    /// Read one mentor through the cache
    Fetch {
        /// Upstream record id
        #[arg(required = true)]
        id: String,
    },

    /// Keep the cache warm until interrupted
    Run,

    /// Print the effective configuration as YAML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fetch_with_global_flags() {
        let cli = Cli::try_parse_from([
            "mentor-shield",
            "fetch",
            "rec42",
            "--log-level",
            "debug",
            "--config",
            "shield.yaml",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.config, Some(PathBuf::from("shield.yaml")));
        assert!(matches!(cli.command, Command::Fetch { ref id } if id == "rec42"));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["mentor-shield"]).is_err());
    }
}
