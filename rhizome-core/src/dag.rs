// Copyright (c) 2026 Rhizome Authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! File import and export
//!
//! Chunks byte streams into leaves and links them into deterministic Merkle
//! trees: balanced bundles of up to 174 children, or the depth-first trickle
//! shape. The reader walks the links back into the original bytes.
//!
//! Determinism matters more than anything else here: the same input under
//! the same options must produce bit-identical root CIDs on every node.

use cid::Cid;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::blocks::{BlockError, BlockService, BlockStat, PutOptions};
use crate::chunker::{Chunker, ChunkerSpec};
use crate::content_id::{Codec, Hasher};
use crate::keys::{KeyError, Keystore};
use crate::unixfs::{self, DagLink, UnixFsError, TYPE_DIRECTORY, TYPE_FILE};

/// Maximum children per inner node.
pub const DEFAULT_LINKS_PER_NODE: usize = 174;

/// Maximum subtree depth in the trickle layout.
pub const TRICKLE_MAX_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Balanced,
    Trickle,
}

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    UnixFs(#[from] UnixFsError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("File declares {declared} bytes but resolves to {actual}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("A protection key is required to read this content")]
    ProtectionKeyRequired,
}

/// Import options.
#[derive(Debug, Clone)]
pub struct AddOptions {
    pub chunker: ChunkerSpec,
    pub hasher: Hasher,
    pub raw_leaves: bool,
    /// Name of a keystore key to seal leaves with; leaves come out under the
    /// cms codec.
    pub protection_key: Option<String>,
    pub pin: bool,
    pub layout: Layout,
    pub cid_version: u32,
    /// Wrap the tree root in a one-entry directory under this name.
    pub wrap: Option<String>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            chunker: ChunkerSpec::default(),
            hasher: Hasher::Sha2_256,
            raw_leaves: false,
            protection_key: None,
            pin: false,
            layout: Layout::Balanced,
            cid_version: 0,
            wrap: None,
        }
    }
}

/// A built subtree: its identifier, the total encoded size beneath it and
/// the file bytes it represents.
#[derive(Debug, Clone, Copy)]
struct NodeRef {
    cid: Cid,
    tsize: u64,
    file_size: u64,
}

impl NodeRef {
    fn link(&self) -> DagLink {
        DagLink {
            cid: self.cid,
            name: String::new(),
            tsize: self.tsize,
        }
    }
}

/// Builds file DAGs on top of the block layer.
pub struct DagBuilder {
    blocks: Arc<BlockService>,
    keystore: Option<Arc<dyn Keystore>>,
}

impl DagBuilder {
    pub fn new(blocks: Arc<BlockService>, keystore: Option<Arc<dyn Keystore>>) -> Self {
        Self { blocks, keystore }
    }

    pub async fn add_bytes(&self, data: &[u8], opts: &AddOptions) -> Result<BlockStat, DagError> {
        self.add_stream(data, opts).await
    }

    /// Chunk `reader` and assemble the tree. Returns the root statistics.
    pub async fn add_stream<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        opts: &AddOptions,
    ) -> Result<BlockStat, DagError> {
        let mut chunker = Chunker::new(reader, opts.chunker);
        let mut leaves = Vec::new();
        while let Some(chunk) = chunker.next_chunk().await? {
            leaves.push(self.make_leaf(&chunk, opts).await?);
        }
        // An empty stream still yields one leaf so empty files have a root
        if leaves.is_empty() {
            leaves.push(self.make_leaf(&[], opts).await?);
        }

        let mut root = match opts.layout {
            Layout::Balanced => self.balanced(leaves, opts).await?,
            Layout::Trickle => self.trickle(leaves, opts).await?,
        };

        if let Some(name) = &opts.wrap {
            root = self.wrap_in_directory(name, root, opts).await?;
        }

        if opts.pin {
            self.blocks.pin_add(&root.cid, true).await?;
        }

        debug!(
            cid = %root.cid,
            bytes = chunker.bytes_read(),
            leaves = chunker.chunks_emitted(),
            "imported stream"
        );
        Ok(BlockStat {
            cid: root.cid,
            size: root.tsize,
        })
    }

    async fn put_node(
        &self,
        bytes: Vec<u8>,
        codec: Codec,
        opts: &AddOptions,
    ) -> Result<Cid, DagError> {
        let stat = self
            .blocks
            .put(
                bytes,
                PutOptions {
                    codec,
                    hasher: opts.hasher,
                    cid_version: opts.cid_version,
                    pin: false,
                    allow_big: false,
                    inline: false,
                },
            )
            .await?;
        Ok(stat.cid)
    }

    async fn make_leaf(&self, chunk: &[u8], opts: &AddOptions) -> Result<NodeRef, DagError> {
        if let Some(key) = &opts.protection_key {
            let keystore = self
                .keystore
                .as_ref()
                .ok_or(DagError::ProtectionKeyRequired)?;
            let envelope = keystore.protect(key, chunk).await?;
            let tsize = envelope.len() as u64;
            let cid = self.put_node(envelope, Codec::Cms, opts).await?;
            return Ok(NodeRef {
                cid,
                tsize,
                file_size: chunk.len() as u64,
            });
        }

        if opts.raw_leaves {
            let cid = self.put_node(chunk.to_vec(), Codec::Raw, opts).await?;
            return Ok(NodeRef {
                cid,
                tsize: chunk.len() as u64,
                file_size: chunk.len() as u64,
            });
        }

        let bytes = unixfs::file_leaf(chunk);
        let tsize = bytes.len() as u64;
        let cid = self.put_node(bytes, Codec::DagPb, opts).await?;
        Ok(NodeRef {
            cid,
            tsize,
            file_size: chunk.len() as u64,
        })
    }

    /// Join up to 174 children under one inner file node.
    async fn link_bundle(&self, children: &[NodeRef], opts: &AddOptions) -> Result<NodeRef, DagError> {
        let links: Vec<DagLink> = children.iter().map(NodeRef::link).collect();
        let blocksizes: Vec<u64> = children.iter().map(|c| c.file_size).collect();
        let bytes = unixfs::file_stem(&links, &blocksizes);

        let node_len = bytes.len() as u64;
        let child_total: u64 = children.iter().map(|c| c.tsize).sum();
        let file_size: u64 = blocksizes.iter().sum();

        let cid = self.put_node(bytes, Codec::DagPb, opts).await?;
        Ok(NodeRef {
            cid,
            tsize: node_len + child_total,
            file_size,
        })
    }

    /// Bundle leaves level by level until a single root remains. A lone leaf
    /// is the root itself, unwrapped.
    async fn balanced(&self, leaves: Vec<NodeRef>, opts: &AddOptions) -> Result<NodeRef, DagError> {
        let mut level = leaves;
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len() / DEFAULT_LINKS_PER_NODE + 1);
            for group in level.chunks(DEFAULT_LINKS_PER_NODE) {
                next.push(self.link_bundle(group, opts).await?);
            }
            level = next;
        }
        level
            .into_iter()
            .next()
            .ok_or_else(|| DagError::InvalidNode("no leaves".into()))
    }

    /// Depth-first layout: alternate direct leaves with strictly deeper
    /// subtrees, up to 174 children and 5 levels.
    async fn trickle(&self, leaves: Vec<NodeRef>, opts: &AddOptions) -> Result<NodeRef, DagError> {
        let mut queue: VecDeque<NodeRef> = leaves.into();
        let mut roots = Vec::new();
        while !queue.is_empty() {
            roots.push(self.trickle_node(&mut queue, 0, opts).await?);
        }
        match roots.len() {
            1 => roots
                .into_iter()
                .next()
                .ok_or_else(|| DagError::InvalidNode("no leaves".into())),
            _ => self.link_bundle(&roots, opts).await,
        }
    }

    fn trickle_node<'a>(
        &'a self,
        queue: &'a mut VecDeque<NodeRef>,
        depth: usize,
        opts: &'a AddOptions,
    ) -> Pin<Box<dyn Future<Output = Result<NodeRef, DagError>> + Send + 'a>> {
        Box::pin(async move {
            let mut children: Vec<NodeRef> = Vec::new();
            while children.len() < DEFAULT_LINKS_PER_NODE && !queue.is_empty() {
                let deeper_allowed = depth + 1 < TRICKLE_MAX_DEPTH;
                if children.len() % 2 == 0 || !deeper_allowed {
                    if let Some(leaf) = queue.pop_front() {
                        children.push(leaf);
                    }
                } else {
                    children.push(self.trickle_node(queue, depth + 1, opts).await?);
                }
            }
            // Single-child nodes collapse to the child
            if children.len() == 1 {
                if let Some(only) = children.into_iter().next() {
                    return Ok(only);
                }
                return Err(DagError::InvalidNode("empty trickle node".into()));
            }
            self.link_bundle(&children, opts).await
        })
    }

    async fn wrap_in_directory(
        &self,
        name: &str,
        root: NodeRef,
        opts: &AddOptions,
    ) -> Result<NodeRef, DagError> {
        let entry = DagLink {
            cid: root.cid,
            name: name.to_string(),
            tsize: root.tsize,
        };
        let bytes = unixfs::directory(&[entry]);
        let node_len = bytes.len() as u64;
        let cid = self.put_node(bytes, Codec::DagPb, opts).await?;
        Ok(NodeRef {
            cid,
            tsize: node_len + root.tsize,
            file_size: root.file_size,
        })
    }
}

/// Read a whole file back by walking its links in order. The declared root
/// file size must match what the leaves resolve to.
pub async fn read_file(
    blocks: &BlockService,
    keystore: Option<&Arc<dyn Keystore>>,
    protection_key: Option<&str>,
    cid: &Cid,
) -> Result<Vec<u8>, DagError> {
    let declared = {
        let bytes = blocks.get(cid).await?;
        if Codec::from_code(cid.codec()) == Some(Codec::DagPb) {
            unixfs::file_size(&bytes)?
        } else {
            None
        }
    };

    let data = read_node(blocks, keystore, protection_key, *cid).await?;

    if let Some(declared) = declared {
        if declared != data.len() as u64 {
            return Err(DagError::SizeMismatch {
                declared,
                actual: data.len() as u64,
            });
        }
    }
    Ok(data)
}

fn read_node<'a>(
    blocks: &'a BlockService,
    keystore: Option<&'a Arc<dyn Keystore>>,
    protection_key: Option<&'a str>,
    cid: Cid,
) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, DagError>> + Send + 'a>> {
    Box::pin(async move {
        let bytes = blocks.get(&cid).await?;
        match Codec::from_code(cid.codec()) {
            Some(Codec::Raw) | None => Ok(bytes),
            Some(Codec::Cms) => {
                let keystore = keystore.ok_or(DagError::ProtectionKeyRequired)?;
                let key = protection_key.ok_or(DagError::ProtectionKeyRequired)?;
                Ok(keystore.unprotect(key, &bytes).await?)
            }
            Some(Codec::DagPb) => {
                let (meta, links) = unixfs::decode_node(&bytes)?;
                if let Some(meta) = &meta {
                    if meta.node_type == TYPE_DIRECTORY {
                        return Err(DagError::InvalidNode(format!("{cid} is a directory")));
                    }
                    if meta.node_type != TYPE_FILE && meta.node_type != 0 {
                        return Err(DagError::InvalidNode(format!(
                            "{cid} is not a file node"
                        )));
                    }
                }
                if links.is_empty() {
                    return Ok(meta.and_then(|m| m.data).unwrap_or_default());
                }
                let mut out = Vec::new();
                for link in links {
                    out.extend(read_node(blocks, keystore, protection_key, link.cid).await?);
                }
                Ok(out)
            }
            Some(other) => Err(DagError::InvalidNode(format!(
                "cannot read {} content as a file",
                other.name()
            ))),
        }
    })
}

/// Resolve an `/ipfs/<cid>[/name...]` path to the CID it points at, walking
/// directory entries by name.
pub async fn resolve_path(blocks: &BlockService, path: &str) -> Result<Cid, DagError> {
    let trimmed = path.strip_prefix("/ipfs/").unwrap_or(path);
    let mut parts = trimmed.split('/').filter(|p| !p.is_empty());
    let head = parts
        .next()
        .ok_or_else(|| DagError::InvalidPath(path.to_string()))?;
    let mut current: Cid = head
        .parse()
        .map_err(|_| DagError::InvalidPath(path.to_string()))?;

    for segment in parts {
        let bytes = blocks.get(&current).await?;
        let links = unixfs::links_of(current.codec(), &bytes)?;
        current = links
            .iter()
            .find(|l| l.name == segment)
            .map(|l| l.cid)
            .ok_or_else(|| {
                DagError::InvalidPath(format!("{segment} not found under {current}"))
            })?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::keys::MemoryKeystore;
    use crate::metrics::Metrics;
    use crate::pin::PinStore;
    use crate::routing::{MemoryDht, Routing};
    use crate::store::FsBlockStore;
    use libp2p::PeerId;

    async fn builder() -> (tempfile::TempDir, Arc<BlockService>, DagBuilder) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlockStore::open(dir.path().join("blocks")).await.unwrap());
        let pins = Arc::new(PinStore::open(dir.path().join("pins")).await.unwrap());
        let exchange = Arc::new(Exchange::new(store.clone(), Metrics::new()));
        let routing = Arc::new(Routing::new(Arc::new(MemoryDht::new(PeerId::random()))));
        let blocks = Arc::new(BlockService::with_default_inlining(
            store, pins, exchange, routing,
        ));
        let keystore: Arc<dyn Keystore> = Arc::new(MemoryKeystore::new());
        let dag = DagBuilder::new(blocks.clone(), Some(keystore));
        (dir, blocks, dag)
    }

    #[tokio::test]
    async fn test_single_leaf_is_root() {
        let (_dir, blocks, dag) = builder().await;
        let stat = dag
            .add_bytes(b"hello world", &AddOptions::default())
            .await
            .unwrap();

        // One block in the store: leaf and root are the same node
        assert_eq!(blocks.store().names().await.unwrap().len(), 1);
        assert_eq!(
            stat.cid.to_string(),
            "Qmf412jQZiuVUtdgnB36FXFX7xg5V6KEbSJ4dpQuhkLyfD"
        );
    }

    #[tokio::test]
    async fn test_deterministic_roots() {
        let (_dir, _blocks, dag) = builder().await;
        let opts = AddOptions {
            chunker: ChunkerSpec::Size(4),
            ..Default::default()
        };
        let a = dag.add_bytes(b"determinism matters", &opts).await.unwrap();
        let b = dag.add_bytes(b"determinism matters", &opts).await.unwrap();
        assert_eq!(a.cid, b.cid);
    }

    #[tokio::test]
    async fn test_roundtrip_chunked() {
        let (_dir, blocks, dag) = builder().await;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let opts = AddOptions {
            chunker: ChunkerSpec::Size(700),
            ..Default::default()
        };

        let stat = dag.add_bytes(&data, &opts).await.unwrap();
        let back = read_file(&blocks, None, None, &stat.cid).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_roundtrip_raw_leaves() {
        let (_dir, blocks, dag) = builder().await;
        let data = vec![0xa5u8; 5000];
        let opts = AddOptions {
            chunker: ChunkerSpec::Size(1024),
            raw_leaves: true,
            ..Default::default()
        };

        let stat = dag.add_bytes(&data, &opts).await.unwrap();
        let back = read_file(&blocks, None, None, &stat.cid).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_trickle_roundtrip() {
        let (_dir, blocks, dag) = builder().await;
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        let opts = AddOptions {
            chunker: ChunkerSpec::Size(512),
            layout: Layout::Trickle,
            ..Default::default()
        };

        let stat = dag.add_bytes(&data, &opts).await.unwrap();
        let back = read_file(&blocks, None, None, &stat.cid).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_trickle_single_leaf_short_circuits() {
        let (_dir, _blocks, dag) = builder().await;
        let balanced = dag
            .add_bytes(b"tiny", &AddOptions::default())
            .await
            .unwrap();
        let trickle = dag
            .add_bytes(
                b"tiny",
                &AddOptions {
                    layout: Layout::Trickle,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // One leaf collapses to the same root in both layouts
        assert_eq!(balanced.cid, trickle.cid);
    }

    #[tokio::test]
    async fn test_wrap_and_resolve() {
        let (_dir, blocks, dag) = builder().await;
        let opts = AddOptions {
            wrap: Some("greeting.txt".to_string()),
            ..Default::default()
        };
        let stat = dag.add_bytes(b"hello world", &opts).await.unwrap();

        let inner = resolve_path(&blocks, &format!("/ipfs/{}/greeting.txt", stat.cid))
            .await
            .unwrap();
        assert_eq!(
            inner.to_string(),
            "Qmf412jQZiuVUtdgnB36FXFX7xg5V6KEbSJ4dpQuhkLyfD"
        );

        let back = read_file(&blocks, None, None, &inner).await.unwrap();
        assert_eq!(back, b"hello world");
    }

    #[tokio::test]
    async fn test_resolve_path_missing_entry() {
        let (_dir, blocks, dag) = builder().await;
        let opts = AddOptions {
            wrap: Some("present".to_string()),
            ..Default::default()
        };
        let stat = dag.add_bytes(b"data", &opts).await.unwrap();

        assert!(matches!(
            resolve_path(&blocks, &format!("/ipfs/{}/absent", stat.cid)).await,
            Err(DagError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_protected_leaves_roundtrip() {
        let (_dir, blocks, dag) = builder().await;
        let keystore: Arc<dyn Keystore> = Arc::new(MemoryKeystore::new());
        keystore.create_key("album", "ed25519").await.unwrap();
        let dag = DagBuilder::new(blocks.clone(), Some(keystore.clone()));

        let opts = AddOptions {
            chunker: ChunkerSpec::Size(16),
            protection_key: Some("album".to_string()),
            ..Default::default()
        };
        let data = b"only for key holders, split across leaves".to_vec();
        let stat = dag.add_bytes(&data, &opts).await.unwrap();

        // Without the key the leaves stay sealed
        assert!(read_file(&blocks, None, None, &stat.cid).await.is_err());

        let back = read_file(&blocks, Some(&keystore), Some("album"), &stat.cid)
            .await
            .unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_add_pins_recursively() {
        let (_dir, blocks, dag) = builder().await;
        let opts = AddOptions {
            chunker: ChunkerSpec::Size(4),
            pin: true,
            ..Default::default()
        };
        let stat = dag.add_bytes(b"pinned content here", &opts).await.unwrap();

        assert!(blocks.is_pinned(&stat.cid).await);
        // Leaves are protected too
        let removed = blocks.garbage_collect().await.unwrap();
        assert_eq!(removed, 0);
        let back = read_file(&blocks, None, None, &stat.cid).await.unwrap();
        assert_eq!(back, b"pinned content here");
    }

    #[tokio::test]
    async fn test_empty_stream_single_leaf() {
        let (_dir, blocks, dag) = builder().await;
        let stat = dag.add_bytes(b"", &AddOptions::default()).await.unwrap();
        assert_eq!(
            stat.cid.to_string(),
            "QmbFMke1KXqnYyBBWxB74N4c5SBnJMVAiMNRcGu6x1AwQH"
        );
        assert_eq!(blocks.store().names().await.unwrap().len(), 1);
        let back = read_file(&blocks, None, None, &stat.cid).await.unwrap();
        assert!(back.is_empty());
    }
}
