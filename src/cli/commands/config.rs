//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/coordinator.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path.
        #[arg(short, long, default_value = "config/coordinator.toml")]
        config: PathBuf,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(&config, &format),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let config = Config::from_file(path)?;

    println!("✓ Config file is valid");
    println!("  public API:   {}", config.network.public_bind);
    println!("  advertised:   {}", config.advertised_endpoint()?);
    println!("  in-VPN port:  {}", config.network.vpn_api_port);
    println!("  attestation:  {}", config.attestation.variant);
    println!("  store:        {}", config.store.endpoint);
    if config.store.ca_cert_path.is_none() {
        println!("  ⚠ Warning: replicated store TLS not configured");
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }
    let config = Config::from_file(path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}
