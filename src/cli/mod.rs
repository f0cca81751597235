//! Command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// Coordinator - control plane of a confidential-computing cluster.
#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the coordinator.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Query a peer's state and VPN peers.
    State(commands::StateArgs),
}
