//! Coordinator - unified CLI entrypoint.
//!
//! Usage:
//!   coordinator start --config config/coordinator.toml
//!   coordinator config validate --config config/coordinator.toml
//!   coordinator state --endpoint 192.0.2.1:9000

use anyhow::Result;
use clap::Parser;
use coordinator::cli::commands::{run_config, run_start_with_config, run_state};
use coordinator::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/coordinator.toml"));

    match cli.command {
        Commands::Start(args) => run_start_with_config(&config_path, args, cli.log_level).await,
        Commands::Config(args) => run_config(args),
        Commands::State(args) => run_state(args).await,
    }
}
