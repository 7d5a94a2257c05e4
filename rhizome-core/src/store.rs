//! Durable block storage
//!
//! One file per block under `<repo>/blocks/`, named by the base32 form of the
//! CID multihash. The store holds nothing but the block bytes, the algorithm
//! and codec travel inside the CID.

use cid::Cid;
use multihash::Multihash;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::content_id::{self, CidError, Codec, Hasher};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Block not found: {0}")]
    NotFound(String),

    #[error("CID verification failed: {0}")]
    Verification(#[from] CidError),

    #[error("Corrupt block file {name}: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A block with its CID and data.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a block from data, computing its CID.
    pub fn compute(data: Vec<u8>, codec: Codec, hasher: Hasher, version: u32) -> Result<Self, CidError> {
        let cid = content_id::cid_for(&data, codec, hasher, version)?;
        Ok(Self { cid, data })
    }

    /// Create a block from a declared CID and data, verifying they match.
    pub fn from_parts(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        content_id::verify(&cid, &data)?;
        Ok(Self { cid, data })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// File name for a multihash: unprefixed base32-lower, valid on any common
/// file system.
pub fn key_for(mh: &Multihash<64>) -> String {
    multibase::Base::Base32Lower.encode(mh.to_bytes())
}

fn key_to_multihash(name: &str) -> Option<Multihash<64>> {
    let bytes = multibase::Base::Base32Lower.decode(name).ok()?;
    Multihash::from_bytes(&bytes).ok()
}

/// File-backed block store. Concurrent readers run unrestricted; writers land
/// complete files via temp-file-and-rename, so a racing pair on the same CID
/// still leaves one intact copy.
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        self.root.join(key_for(cid.hash()))
    }

    /// Store `data` under `cid`. Idempotent: an existing file for the same
    /// multihash is left untouched.
    pub async fn put(&self, cid: &Cid, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(cid);
        if tokio::fs::try_exists(&path).await? {
            debug!(cid = %cid, "block already stored");
            return Ok(());
        }

        let tmp = self
            .root
            .join(format!(".tmp-{}-{:08x}", key_for(cid.hash()), rand::random::<u32>()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;

        debug!(cid = %cid, size = data.len(), "stored block");
        Ok(())
    }

    /// Fetch the block bytes, or `None` when absent.
    pub async fn try_get(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(cid)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the block bytes, failing when absent.
    pub async fn get(&self, cid: &Cid) -> Result<Vec<u8>, StoreError> {
        self.try_get(cid)
            .await?
            .ok_or_else(|| StoreError::NotFound(cid.to_string()))
    }

    /// Size in bytes of a stored block without reading it.
    pub async fn len(&self, cid: &Cid) -> Result<u64, StoreError> {
        match tokio::fs::metadata(self.path_for(cid)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(cid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, cid: &Cid) -> bool {
        tokio::fs::try_exists(self.path_for(cid))
            .await
            .unwrap_or(false)
    }

    pub async fn remove(&self, cid: &Cid) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(cid)).await {
            Ok(()) => {
                debug!(cid = %cid, "removed block");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(cid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All multihashes currently stored. Temp files and foreign names are
    /// skipped.
    pub async fn names(&self) -> Result<Vec<Multihash<64>>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(".tmp-") {
                continue;
            }
            match key_to_multihash(name) {
                Some(mh) => out.push(mh),
                None => warn!(file = name, "skipping foreign file in block store"),
            }
        }
        Ok(out)
    }

    /// Rehash every stored block against the algorithm named by its key.
    /// Returns the keys of corrupt entries; an empty list means a clean store.
    pub async fn verify_all(&self) -> Result<Vec<String>, StoreError> {
        let mut corrupt = Vec::new();
        for mh in self.names().await? {
            let name = key_for(&mh);
            let bytes = match tokio::fs::read(self.root.join(&name)).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    corrupt.push(name.clone());
                    warn!(file = %name, error = %e, "unreadable block file");
                    continue;
                }
            };
            let Some(hasher) = Hasher::from_code(mh.code()) else {
                corrupt.push(name);
                continue;
            };
            match hasher.digest(&bytes) {
                Ok(computed) if computed.digest() == mh.digest() => {}
                _ => {
                    warn!(file = %name, "block bytes fail rehash");
                    corrupt.push(name);
                }
            }
        }
        if !corrupt.is_empty() {
            info!(count = corrupt.len(), "integrity scan found corrupt blocks");
        }
        Ok(corrupt)
    }
}
