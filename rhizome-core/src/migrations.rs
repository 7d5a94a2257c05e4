//! Repository migrations
//!
//! Ordered single-step upgrades and downgrades over the on-disk layout. The
//! persisted version advances one step at a time so an interrupted run
//! resumes where it stopped. Migrations are idempotent and walk over corrupt
//! entries instead of aborting.

use async_trait::async_trait;
use multihash::Multihash;
use tracing::{debug, info, warn};

use crate::repo::{FsRepo, RepoError};
use crate::store::key_for;

/// Version a freshly migrated repository ends up at.
pub const CURRENT_REPO_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("No migration from version {from} towards {target}")]
    Conflict { from: u32, target: u32 },

    #[error("Migration to version {0} cannot run in that direction")]
    Unsupported(u32),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One reversible layout change. `version` names the version the upgrade
/// leaves the repository at.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;
    fn can_upgrade(&self) -> bool;
    fn can_downgrade(&self) -> bool;
    async fn upgrade(&self, repo: &FsRepo) -> Result<(), MigrationError>;
    async fn downgrade(&self, repo: &FsRepo) -> Result<(), MigrationError>;
}

/// v1: the initial directory layout plus a default config.
struct InitialLayout;

#[async_trait]
impl Migration for InitialLayout {
    fn version(&self) -> u32 {
        1
    }

    fn can_upgrade(&self) -> bool {
        true
    }

    fn can_downgrade(&self) -> bool {
        true
    }

    async fn upgrade(&self, repo: &FsRepo) -> Result<(), MigrationError> {
        tokio::fs::create_dir_all(repo.blocks_dir()).await?;
        tokio::fs::create_dir_all(repo.pins_dir()).await?;
        if !tokio::fs::try_exists(repo.config_path()).await? {
            repo.write_config(&Default::default()).await?;
        }
        Ok(())
    }

    async fn downgrade(&self, _repo: &FsRepo) -> Result<(), MigrationError> {
        // The layout stays behind; version 0 tooling ignores it
        Ok(())
    }
}

/// v2: block and pin files move from legacy hex names to base32.
struct Base32FileNames;

impl Base32FileNames {
    async fn rekey_dir(
        dir: &std::path::Path,
        encode: fn(&Multihash<64>) -> String,
        decode: fn(&str) -> Option<Multihash<64>>,
    ) -> Result<(), MigrationError> {
        if !tokio::fs::try_exists(dir).await? {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(mh) = decode(name) else {
                // Already in the target form, or foreign; both are left alone
                continue;
            };
            let target = encode(&mh);
            if target == name {
                continue;
            }
            if let Err(e) = tokio::fs::rename(entry.path(), dir.join(&target)).await {
                warn!(file = name, error = %e, "skipping unrenameable entry");
            } else {
                debug!(from = name, to = %target, "re-keyed entry");
            }
        }
        Ok(())
    }

    fn decode_hex(name: &str) -> Option<Multihash<64>> {
        let bytes = hex::decode(name).ok()?;
        Multihash::from_bytes(&bytes).ok()
    }

    fn decode_base32(name: &str) -> Option<Multihash<64>> {
        let bytes = multibase::Base::Base32Lower.decode(name).ok()?;
        Multihash::from_bytes(&bytes).ok()
    }

    fn encode_hex(mh: &Multihash<64>) -> String {
        hex::encode(mh.to_bytes())
    }
}

#[async_trait]
impl Migration for Base32FileNames {
    fn version(&self) -> u32 {
        2
    }

    fn can_upgrade(&self) -> bool {
        true
    }

    fn can_downgrade(&self) -> bool {
        true
    }

    async fn upgrade(&self, repo: &FsRepo) -> Result<(), MigrationError> {
        for dir in [repo.blocks_dir(), repo.pins_dir()] {
            Self::rekey_dir(&dir, key_for, Self::decode_hex).await?;
        }
        Ok(())
    }

    async fn downgrade(&self, repo: &FsRepo) -> Result<(), MigrationError> {
        for dir in [repo.blocks_dir(), repo.pins_dir()] {
            Self::rekey_dir(&dir, Self::encode_hex, Self::decode_base32).await?;
        }
        Ok(())
    }
}

/// The ordered migration registry.
pub struct Migrator {
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// All known migrations, in version order.
    pub fn standard() -> Self {
        Self {
            migrations: vec![Box::new(InitialLayout), Box::new(Base32FileNames)],
        }
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.iter().map(|m| m.version()).max().unwrap_or(0)
    }

    fn find(&self, version: u32) -> Option<&dyn Migration> {
        self.migrations
            .iter()
            .find(|m| m.version() == version)
            .map(|m| m.as_ref())
    }

    /// Walk the repository version to `target`, one step at a time,
    /// persisting after every step. Targets no migration reaches are a
    /// conflict.
    pub async fn migrate_to(&self, repo: &FsRepo, target: u32) -> Result<(), MigrationError> {
        if target > self.latest_version() {
            return Err(MigrationError::Conflict {
                from: repo.version().await?,
                target,
            });
        }

        let mut current = repo.version().await?;
        while current != target {
            if target > current {
                let next = current + 1;
                let migration = self.find(next).ok_or(MigrationError::Conflict {
                    from: current,
                    target,
                })?;
                if !migration.can_upgrade() {
                    return Err(MigrationError::Unsupported(next));
                }
                info!(from = current, to = next, "upgrading repository");
                migration.upgrade(repo).await?;
                repo.set_version(next).await?;
                current = next;
            } else {
                let migration = self.find(current).ok_or(MigrationError::Conflict {
                    from: current,
                    target,
                })?;
                if !migration.can_downgrade() {
                    return Err(MigrationError::Unsupported(current));
                }
                info!(from = current, to = current - 1, "downgrading repository");
                migration.downgrade(repo).await?;
                current -= 1;
                repo.set_version(current).await?;
            }
        }
        Ok(())
    }
}
