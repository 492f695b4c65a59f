use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "capgate", version, about = "Aggregating MCP gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway, serving the configured transport.
    Start {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "config/capgate.yaml")]
        config: PathBuf,

        /// Overrides `server.host` from the config file.
        #[arg(long)]
        host: Option<String>,

        /// Overrides `server.port` from the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Overrides the configured log level (e.g. debug, info, warn).
        #[arg(long)]
        log_level: Option<String>,

        /// Fork into the background and record a named session.
        #[arg(long)]
        detach: bool,

        /// Session name for `--detach` (default: derived from the port).
        #[arg(long)]
        name: Option<String>,
    },
    /// Show the status of detached sessions.
    Status {
        /// Session name; omit to list every session.
        name: Option<String>,
    },
    /// Stop a detached session.
    Stop {
        /// Session name; omit if exactly one session is running.
        name: Option<String>,
    },
}
