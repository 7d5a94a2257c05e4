//! Durable pin records
//!
//! One file per pinned CID under `<repo>/pins/`, named like the block store
//! keys. The file body is the pin kind, so a crash between "record written"
//! and "block fetched" still protects the target from garbage collection.
//! Recursive walks over DAG links live in the block layer, which owns the
//! fetching.

use cid::Cid;
use multihash::Multihash;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::key_for;

#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("Not pinned: {0}")]
    NotPinned(String),

    #[error("Invalid pin record {name}: {body:?}")]
    InvalidRecord { name: String, body: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    Direct,
    Recursive,
}

impl PinKind {
    fn as_str(&self) -> &'static str {
        match self {
            PinKind::Direct => "direct",
            PinKind::Recursive => "recursive",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "direct" => Some(PinKind::Direct),
            "recursive" => Some(PinKind::Recursive),
            _ => None,
        }
    }
}

/// A pinned multihash together with its kind.
#[derive(Debug, Clone)]
pub struct PinRecord {
    pub hash: Multihash<64>,
    pub kind: PinKind,
}

/// File-backed pin set. Mutations are serialized behind one lock so two
/// concurrent pin/unpin calls on the same CID cannot interleave their
/// record writes.
pub struct PinStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl PinStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PinError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, cid: &Cid) -> PathBuf {
        self.root.join(key_for(cid.hash()))
    }

    /// Persist a pin record. Overwrites any existing record for the CID,
    /// which lets a direct pin be upgraded to recursive.
    pub async fn set(&self, cid: &Cid, kind: PinKind) -> Result<(), PinError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::write(self.path_for(cid), kind.as_str()).await?;
        debug!(cid = %cid, kind = kind.as_str(), "pinned");
        Ok(())
    }

    /// Remove the record for a CID. Missing records fail with `NotPinned`.
    pub async fn unset(&self, cid: &Cid) -> Result<(), PinError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(cid)).await {
            Ok(()) => {
                debug!(cid = %cid, "unpinned");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PinError::NotPinned(cid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn kind_of(&self, cid: &Cid) -> Result<Option<PinKind>, PinError> {
        match tokio::fs::read_to_string(self.path_for(cid)).await {
            Ok(body) => {
                let kind = PinKind::parse(&body).ok_or_else(|| PinError::InvalidRecord {
                    name: key_for(cid.hash()),
                    body,
                })?;
                Ok(Some(kind))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_pinned(&self, cid: &Cid) -> bool {
        matches!(self.kind_of(cid).await, Ok(Some(_)))
    }

    /// All pin records, optionally filtered by kind. Records with
    /// unparseable bodies are skipped rather than failing the listing.
    pub async fn list(&self, filter: Option<PinKind>) -> Result<Vec<PinRecord>, PinError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(bytes) = multibase::Base::Base32Lower.decode(name) else {
                continue;
            };
            let Ok(hash) = Multihash::from_bytes(&bytes) else {
                continue;
            };
            let body = tokio::fs::read_to_string(entry.path()).await?;
            let Some(kind) = PinKind::parse(&body) else {
                tracing::warn!(file = name, "skipping unparseable pin record");
                continue;
            };
            if filter.map_or(true, |f| f == kind) {
                out.push(PinRecord { hash, kind });
            }
        }
        Ok(out)
    }
}
