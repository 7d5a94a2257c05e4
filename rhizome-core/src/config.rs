//! Configuration management
//!
//! CLI argument parsing and node-level settings, merged with the repository
//! config on startup.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "rhizome")]
#[command(about = "Content-addressed peer-to-peer file system node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the node daemon
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Repository directory
    #[arg(long, default_value = "./repo")]
    pub repo_dir: PathBuf,

    /// TCP port for the swarm transport (0 picks a free port)
    #[arg(long, default_value_t = 4001)]
    pub listen_port: u16,

    /// Logging filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Additional bootstrap multiaddresses, on top of the repo config
    #[arg(long)]
    pub bootstrap: Vec<String>,

    /// Seconds between background discovery walks; 0 disables the walker
    #[arg(long, default_value_t = 60)]
    pub discovery_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub repo_dir: PathBuf,
    pub listen_port: u16,
    pub log_level: String,
    pub bootstrap: Vec<String>,
    pub discovery_interval: u64,
}

impl NodeConfig {
    /// Parse CLI arguments into a config.
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        match cli.command {
            Commands::Start(cmd) => Ok(cmd.into()),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            repo_dir: PathBuf::from("./repo"),
            listen_port: 4001,
            log_level: "info".to_string(),
            bootstrap: Vec::new(),
            discovery_interval: 60,
        }
    }
}

impl From<StartCommand> for NodeConfig {
    fn from(cmd: StartCommand) -> Self {
        NodeConfig {
            repo_dir: cmd.repo_dir,
            listen_port: cmd.listen_port,
            log_level: cmd.log_level,
            bootstrap: cmd.bootstrap,
            discovery_interval: cmd.discovery_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.repo_dir, PathBuf::from("./repo"));
        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.log_level, "info");
        assert!(config.bootstrap.is_empty());
    }

    #[test]
    fn test_config_from_start_command() {
        let cmd = StartCommand {
            repo_dir: PathBuf::from("/var/lib/rhizome"),
            listen_port: 9000,
            log_level: "debug".to_string(),
            bootstrap: vec!["/ip4/10.1.1.1/tcp/4001".to_string()],
            discovery_interval: 30,
        };

        let config: NodeConfig = cmd.into();
        assert_eq!(config.repo_dir, PathBuf::from("/var/lib/rhizome"));
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.bootstrap.len(), 1);
        assert_eq!(config.discovery_interval, 30);
    }
}
