//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start the coordinator.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Override the public API bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Override the endpoint advertised to other peers.
    #[arg(long)]
    pub public_endpoint: Option<String>,
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Run the start command with the given config path.
///
/// A missing config file is not an error; defaults apply.
pub async fn run_start_with_config(
    config_path: &Path,
    args: StartArgs,
    log_level: Option<String>,
) -> Result<()> {
    let mut config = if config_path.exists() {
        Config::from_file(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?
    } else {
        Config::default()
    };
    config.apply_overrides(&ConfigOverrides {
        log_level,
        public_bind: args.bind,
        public_endpoint: args.public_endpoint,
    });
    config.validate().context("invalid configuration")?;

    init_tracing(&config.telemetry.log_level);
    if !config_path.exists() {
        tracing::warn!(path = %config_path.display(), "config file not found, using defaults");
    }

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
