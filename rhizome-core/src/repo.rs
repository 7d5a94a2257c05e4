//! On-disk repository layout
//!
//! ```text
//! <root>/version       single-line repository version integer
//! <root>/config        JSON: addresses and bootstrap peers
//! <root>/blocks/       one file per block
//! <root>/pins/         one file per pin record
//! <root>/namesys.seq   append-only name sequence log
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Corrupt repository: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addresses {
    #[serde(rename = "Swarm")]
    pub swarm: Vec<String>,
    #[serde(rename = "API")]
    pub api: String,
    #[serde(rename = "Gateway")]
    pub gateway: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(rename = "Addresses")]
    pub addresses: Addresses,
    #[serde(rename = "Bootstrap")]
    pub bootstrap: Vec<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            addresses: Addresses {
                swarm: vec!["/ip4/0.0.0.0/tcp/4001".to_string()],
                api: "/ip4/127.0.0.1/tcp/5001".to_string(),
                gateway: "/ip4/127.0.0.1/tcp/8080".to_string(),
            },
            bootstrap: Vec::new(),
        }
    }
}

/// Handle to a repository root. Creating the handle only ensures the root
/// directory exists; the layout inside is the migrator's concern.
pub struct FsRepo {
    root: PathBuf,
}

impl FsRepo {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, RepoError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    pub fn pins_dir(&self) -> PathBuf {
        self.root.join("pins")
    }

    pub fn seq_path(&self) -> PathBuf {
        self.root.join("namesys.seq")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config")
    }

    fn version_path(&self) -> PathBuf {
        self.root.join("version")
    }

    /// Current repository version; a repo without a version file is at 0.
    pub async fn version(&self) -> Result<u32, RepoError> {
        match tokio::fs::read_to_string(self.version_path()).await {
            Ok(body) => body
                .trim()
                .parse()
                .map_err(|_| RepoError::Corrupt(format!("bad version file {body:?}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set_version(&self, version: u32) -> Result<(), RepoError> {
        tokio::fs::write(self.version_path(), format!("{version}\n")).await?;
        Ok(())
    }

    /// Load the repository config, falling back to defaults when the file
    /// does not exist yet.
    pub async fn read_config(&self) -> Result<RepoConfig, RepoError> {
        match tokio::fs::read_to_string(self.config_path()).await {
            Ok(body) => Ok(serde_json::from_str(&body)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RepoConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_config(&self, config: &RepoConfig) -> Result<(), RepoError> {
        let body = serde_json::to_string_pretty(config)?;
        tokio::fs::write(self.config_path(), body).await?;
        Ok(())
    }
}
