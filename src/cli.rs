//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Reverse-proxy sidecar - virtual hosts and certificates from running containers
#[derive(Parser, Debug)]
#[command(name = "vhostgen")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VHOSTGEN_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "VHOSTGEN_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VHOSTGEN_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to watch mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch container events and keep the proxy configuration current (default)
    Watch {
        /// Do not serve the control endpoints
        #[arg(long)]
        no_control: bool,
    },

    /// Run one generation cycle and exit
    Generate {
        /// Reload the proxy even if the configuration is unchanged
        #[arg(long)]
        reload: bool,
    },
}
