//! Command-line argument parsing.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use parley_network::NetworkConfig;

/// Chat with nearby devices, no server required.
#[derive(Parser, Debug, Clone)]
#[command(name = "parley")]
#[command(about = "Serverless local-network messenger")]
#[command(version)]
pub struct Cli {
    /// Name other devices see.
    #[arg(long)]
    pub name: String,

    /// Service namespace; only devices in the same namespace meet.
    #[arg(long, default_value = "chat")]
    pub service: String,

    /// Opaque JSON attributes published with our identity.
    #[arg(long)]
    pub json_data: Option<String>,

    /// Config file (defaults to `~/.parley/config.json`).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TCP listen address, overrides the config file.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// UDP discovery port, overrides the config file.
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// Comma-separated discovery targets, overrides the config file.
    #[arg(long, value_delimiter = ',')]
    pub announce: Option<Vec<SocketAddr>>,

    /// Write the effective config back to the config file.
    #[arg(long)]
    pub save_config: bool,

    /// Log to the file only, keeping the terminal for chat.
    #[arg(long, short)]
    pub quiet: bool,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The config file to read, explicit or default.
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => Ok(base_dir()?.join("config.json")),
        }
    }

    /// Apply command-line overrides on top of a loaded config.
    pub fn apply_overrides(&self, config: &mut NetworkConfig) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
        if let Some(targets) = &self.announce {
            config.announce_addrs = targets.clone();
        }
    }
}

/// Returns the base directory: `~/.parley/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".parley"))
}

/// Returns the logs directory: `~/.parley/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}
