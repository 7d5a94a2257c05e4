//! Block layer
//!
//! Sits on top of the store, pin set, exchange engine and routing facade.
//! Reads prefer local storage and fall back to racing the exchange against a
//! provider hunt; writes persist, settle local waiters and advertise.

use cid::Cid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::content_id::{self, CidError, Codec, Hasher, INLINE_LIMIT, MAX_BLOCK_SIZE};
use crate::exchange::Exchange;
use crate::node::NodeCommand;
use crate::pin::{PinError, PinKind, PinStore};
use crate::routing::Routing;
use crate::store::{Block, FsBlockStore, StoreError};
use crate::unixfs;

/// Providers asked for per missing block.
const MAX_PROVIDERS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Block of {0} bytes exceeds the {MAX_BLOCK_SIZE} byte limit")]
    TooLarge(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cancelled while waiting for {0}")]
    Cancelled(Cid),

    #[error(transparent)]
    Cid(#[from] CidError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pin(#[from] PinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStat {
    pub cid: Cid,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct PutOptions {
    pub codec: Codec,
    pub hasher: Hasher,
    pub cid_version: u32,
    pub pin: bool,
    pub allow_big: bool,
    /// Permit inlining into an identity CID when the service has it enabled.
    /// DAG leaves switch this off, their identifiers must be resolvable by
    /// remote peers.
    pub inline: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            codec: Codec::DagPb,
            hasher: Hasher::Sha2_256,
            cid_version: 0,
            pin: false,
            allow_big: false,
            inline: true,
        }
    }
}

/// Block-level service shared by the importer, archive codec and node
/// surface.
pub struct BlockService {
    store: Arc<FsBlockStore>,
    pins: Arc<PinStore>,
    exchange: Arc<Exchange>,
    routing: Arc<Routing>,
    commands: Mutex<Option<mpsc::UnboundedSender<NodeCommand>>>,
    online: AtomicBool,
    /// `None` disables inlining entirely.
    inline_limit: Option<usize>,
}

impl BlockService {
    pub fn new(
        store: Arc<FsBlockStore>,
        pins: Arc<PinStore>,
        exchange: Arc<Exchange>,
        routing: Arc<Routing>,
        inline_limit: Option<usize>,
    ) -> Self {
        Self {
            store,
            pins,
            exchange,
            routing,
            commands: Mutex::new(None),
            online: AtomicBool::new(false),
            inline_limit,
        }
    }

    pub fn with_default_inlining(
        store: Arc<FsBlockStore>,
        pins: Arc<PinStore>,
        exchange: Arc<Exchange>,
        routing: Arc<Routing>,
    ) -> Self {
        Self::new(store, pins, exchange, routing, Some(INLINE_LIMIT))
    }

    pub fn store(&self) -> &Arc<FsBlockStore> {
        &self.store
    }

    pub fn pins(&self) -> &Arc<PinStore> {
        &self.pins
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn routing(&self) -> &Arc<Routing> {
        &self.routing
    }

    /// Wire up the node command channel and flip the service online. Until
    /// then reads stay local-and-exchange only.
    pub fn set_online(&self, commands: mpsc::UnboundedSender<NodeCommand>) {
        *self.commands.lock().expect("commands lock") = Some(commands);
        self.online.store(true, Ordering::Release);
    }

    pub fn set_offline(&self) {
        self.online.store(false, Ordering::Release);
        *self.commands.lock().expect("commands lock") = None;
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn effective_version(codec: Codec, hasher: Hasher, requested: u32) -> u32 {
        if codec != Codec::DagPb || hasher != Hasher::Sha2_256 {
            1
        } else {
            requested
        }
    }

    /// Store raw bytes as a block.
    pub async fn put(&self, data: Vec<u8>, opts: PutOptions) -> Result<BlockStat, BlockError> {
        if data.len() > MAX_BLOCK_SIZE && !opts.allow_big {
            return Err(BlockError::TooLarge(data.len()));
        }

        let inline = opts.hasher == Hasher::Identity
            || (opts.inline && self.inline_limit.map_or(false, |limit| data.len() <= limit));
        if inline && data.len() <= INLINE_LIMIT {
            let cid = content_id::inline_cid(&data, opts.codec)?;
            trace!(cid = %cid, "inlined block");
            return Ok(BlockStat {
                cid,
                size: data.len() as u64,
            });
        }
        if opts.hasher == Hasher::Identity {
            return Err(BlockError::InvalidArgument(format!(
                "identity hash limited to {INLINE_LIMIT} bytes"
            )));
        }

        let version = Self::effective_version(opts.codec, opts.hasher, opts.cid_version);
        let block = Block::compute(data, opts.codec, opts.hasher, version)?;
        let size = block.data.len() as u64;

        self.store.put(&block.cid, &block.data).await?;
        // Local availability settles waiters before the caller returns
        self.exchange.block_added(&block).await;
        self.advertise(block.cid);

        if opts.pin {
            self.pins.set(&block.cid, PinKind::Direct).await?;
        }

        Ok(BlockStat {
            cid: block.cid,
            size,
        })
    }

    /// Store bytes under a caller-declared CID, verifying the hash. Used by
    /// the archive importer and anything else that replays existing blocks.
    pub async fn put_verified(&self, cid: &Cid, data: &[u8]) -> Result<(), BlockError> {
        if content_id::inline_data(cid).is_some() {
            return Ok(());
        }
        let block = Block::from_parts(*cid, data.to_vec())?;
        self.store.put(&block.cid, &block.data).await?;
        self.exchange.block_added(&block).await;
        Ok(())
    }

    /// Fetch block bytes: inline, then local, then the network. Fails only
    /// when the caller's wait is cancelled.
    pub async fn get(&self, cid: &Cid) -> Result<Vec<u8>, BlockError> {
        if let Some(data) = content_id::inline_data(cid) {
            return Ok(data);
        }
        if let Some(bytes) = self.store.try_get(cid).await? {
            return Ok(bytes);
        }

        debug!(cid = %cid, "block missing locally, going to the network");
        let handle = self.exchange.want_block(*cid).await;
        let hunt = self.spawn_provider_hunt(*cid);

        let result = handle.wait().await;
        if let Some(hunt) = hunt {
            hunt.abort();
        }
        match result {
            Ok(block) => Ok(block.data),
            Err(cancelled) => Err(BlockError::Cancelled(cancelled.0)),
        }
    }

    /// Query routing for providers of `cid` and dial each through the node
    /// command channel. Failures stay inside the task.
    fn spawn_provider_hunt(&self, cid: Cid) -> Option<tokio::task::JoinHandle<()>> {
        if !self.is_online() {
            return None;
        }
        let commands = self.commands.lock().expect("commands lock").clone()?;
        let routing = self.routing.clone();
        Some(tokio::spawn(async move {
            let outcome = routing
                .find_providers(&cid, MAX_PROVIDERS, |provider| {
                    let _ = commands.send(NodeCommand::Dial(
                        provider.peer,
                        provider.addrs.clone(),
                    ));
                })
                .await;
            match outcome {
                Ok(providers) => {
                    debug!(cid = %cid, count = providers.len(), "provider hunt finished")
                }
                Err(e) => debug!(cid = %cid, error = %e, "provider hunt failed"),
            }
        }))
    }

    fn advertise(&self, cid: Cid) {
        if !self.is_online() {
            return;
        }
        let routing = self.routing.clone();
        tokio::spawn(async move {
            if let Err(e) = routing.provide(&cid, true).await {
                debug!(cid = %cid, error = %e, "advertise failed");
            }
        });
    }

    /// Block statistics without reading the full bytes when avoidable.
    pub async fn stat(&self, cid: &Cid) -> Result<BlockStat, BlockError> {
        if let Some(data) = content_id::inline_data(cid) {
            return Ok(BlockStat {
                cid: *cid,
                size: data.len() as u64,
            });
        }
        match self.store.len(cid).await {
            Ok(size) => Ok(BlockStat { cid: *cid, size }),
            Err(StoreError::NotFound(_)) => {
                let bytes = self.get(cid).await?;
                Ok(BlockStat {
                    cid: *cid,
                    size: bytes.len() as u64,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a block and its pin record. Absent blocks fail unless
    /// `ignore_missing`.
    pub async fn remove(&self, cid: &Cid, ignore_missing: bool) -> Result<Cid, BlockError> {
        let _ = self.pins.unset(cid).await;
        match self.store.remove(cid).await {
            Ok(()) => Ok(*cid),
            Err(StoreError::NotFound(_)) if ignore_missing => Ok(*cid),
            Err(StoreError::NotFound(name)) => Err(BlockError::NotFound(name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Pin `cid`, fetching whatever is not local. The record lands before
    /// the fetch so a crash mid-walk still protects the target. Recursive
    /// pins walk the dag-pb closure, recording every reached child.
    pub async fn pin_add(&self, cid: &Cid, recursive: bool) -> Result<(), BlockError> {
        let mut stack = vec![(*cid, if recursive { PinKind::Recursive } else { PinKind::Direct })];
        let mut seen = std::collections::HashSet::new();

        while let Some((current, kind)) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            self.pins.set(&current, kind).await?;
            let bytes = self.get(&current).await?;
            if recursive {
                match unixfs::links_of(current.codec(), &bytes) {
                    Ok(links) => {
                        for link in links {
                            stack.push((link.cid, PinKind::Direct));
                        }
                    }
                    Err(e) => warn!(cid = %current, error = %e, "unwalkable node while pinning"),
                }
            }
        }
        Ok(())
    }

    /// Mirror of `pin_add`: unpin the CID and, for recursive pins, its
    /// locally-known closure.
    pub async fn pin_remove(&self, cid: &Cid, recursive: bool) -> Result<(), BlockError> {
        let mut stack = vec![*cid];
        let mut seen = std::collections::HashSet::new();
        let mut first = true;

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            match self.pins.unset(&current).await {
                Ok(()) => {}
                Err(PinError::NotPinned(name)) if !first => {
                    trace!(cid = %name, "child already unpinned");
                }
                Err(e) => return Err(e.into()),
            }
            first = false;
            if recursive {
                if let Ok(Some(bytes)) = self.store.try_get(&current).await {
                    if let Ok(links) = unixfs::links_of(current.codec(), &bytes) {
                        stack.extend(links.into_iter().map(|l| l.cid));
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn is_pinned(&self, cid: &Cid) -> bool {
        self.pins.is_pinned(cid).await
    }

    /// Drop every stored block outside the pinned closure. Returns how many
    /// blocks were collected.
    pub async fn garbage_collect(&self) -> Result<usize, BlockError> {
        let mut live: std::collections::HashSet<Vec<u8>> = std::collections::HashSet::new();
        let mut roots = Vec::new();
        for record in self.pins.list(None).await? {
            live.insert(record.hash.to_bytes());
            if record.kind == PinKind::Recursive {
                roots.push(record.hash);
            }
        }

        // Recursive roots protect their whole reachable closure, walked over
        // local blocks only
        let mut stack: Vec<Cid> = Vec::new();
        for mh in roots {
            stack.push(Cid::new_v1(Codec::DagPb.code(), mh));
        }
        let mut seen = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(*current.hash()) {
                continue;
            }
            live.insert(current.hash().to_bytes());
            if let Some(bytes) = self.store.try_get(&current).await? {
                if let Ok(links) = unixfs::links_of(current.codec(), &bytes) {
                    stack.extend(links.into_iter().map(|l| l.cid));
                }
            }
        }

        let mut removed = 0;
        for mh in self.store.names().await? {
            if live.contains(&mh.to_bytes()) {
                continue;
            }
            let victim = Cid::new_v1(Codec::Raw.code(), mh);
            match self.store.remove(&victim).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(error = %e, "failed to collect block"),
            }
        }
        debug!(removed, "garbage collection finished");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::routing::MemoryDht;
    use libp2p::PeerId;

    async fn service() -> (tempfile::TempDir, Arc<BlockService>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlockStore::open(dir.path().join("blocks")).await.unwrap());
        let pins = Arc::new(PinStore::open(dir.path().join("pins")).await.unwrap());
        let exchange = Arc::new(Exchange::new(store.clone(), Metrics::new()));
        let routing = Arc::new(Routing::new(Arc::new(MemoryDht::new(PeerId::random()))));
        (
            dir,
            Arc::new(BlockService::with_default_inlining(
                store, pins, exchange, routing,
            )),
        )
    }

    fn raw_put() -> PutOptions {
        PutOptions {
            codec: Codec::Raw,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (_dir, blocks) = service().await;
        let data = vec![42u8; 200];

        let stat = blocks.put(data.clone(), raw_put()).await.unwrap();
        assert_eq!(stat.size, 200);
        assert_eq!(blocks.get(&stat.cid).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_put_idempotent() {
        let (_dir, blocks) = service().await;
        let data = vec![7u8; 128];

        let first = blocks.put(data.clone(), raw_put()).await.unwrap();
        let second = blocks.put(data, raw_put()).await.unwrap();
        assert_eq!(first.cid, second.cid);
        assert_eq!(blocks.store().names().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inline_small_blocks() {
        let (_dir, blocks) = service().await;

        let stat = blocks.put(b"blorb".to_vec(), raw_put()).await.unwrap();
        assert_eq!(stat.cid.to_string(), "bafkqablcnrxxeyq");
        // Nothing written, yet readable
        assert!(blocks.store().names().await.unwrap().is_empty());
        assert_eq!(blocks.get(&stat.cid).await.unwrap(), b"blorb");
    }

    #[tokio::test]
    async fn test_inline_boundary() {
        let (_dir, blocks) = service().await;

        let at_limit = blocks
            .put(vec![1u8; INLINE_LIMIT], raw_put())
            .await
            .unwrap();
        assert!(content_id::inline_data(&at_limit.cid).is_some());

        let over_limit = blocks
            .put(vec![1u8; INLINE_LIMIT + 1], raw_put())
            .await
            .unwrap();
        assert!(content_id::inline_data(&over_limit.cid).is_none());
        assert!(blocks.store().exists(&over_limit.cid).await);
    }

    #[tokio::test]
    async fn test_size_limit() {
        let (_dir, blocks) = service().await;

        let exact = vec![0u8; MAX_BLOCK_SIZE];
        assert!(blocks.put(exact, raw_put()).await.is_ok());

        let over = vec![0u8; MAX_BLOCK_SIZE + 1];
        assert!(matches!(
            blocks.put(over.clone(), raw_put()).await,
            Err(BlockError::TooLarge(_))
        ));

        let opts = PutOptions {
            allow_big: true,
            ..raw_put()
        };
        assert!(blocks.put(over, opts).await.is_ok());
    }

    #[tokio::test]
    async fn test_stat() {
        let (_dir, blocks) = service().await;
        let stat = blocks.put(vec![9u8; 300], raw_put()).await.unwrap();

        let queried = blocks.stat(&stat.cid).await.unwrap();
        assert_eq!(queried, stat);
    }

    #[tokio::test]
    async fn test_remove() {
        let (_dir, blocks) = service().await;
        let stat = blocks.put(vec![5u8; 100], raw_put()).await.unwrap();

        assert_eq!(blocks.remove(&stat.cid, false).await.unwrap(), stat.cid);
        assert!(matches!(
            blocks.remove(&stat.cid, false).await,
            Err(BlockError::NotFound(_))
        ));
        assert_eq!(blocks.remove(&stat.cid, true).await.unwrap(), stat.cid);
    }

    #[tokio::test]
    async fn test_put_pins_when_asked() {
        let (_dir, blocks) = service().await;
        let opts = PutOptions {
            pin: true,
            ..raw_put()
        };
        let stat = blocks.put(vec![3u8; 100], opts).await.unwrap();
        assert!(blocks.is_pinned(&stat.cid).await);
    }

    #[tokio::test]
    async fn test_gc_respects_pins() {
        let (_dir, blocks) = service().await;
        let kept = blocks
            .put(
                vec![1u8; 100],
                PutOptions {
                    pin: true,
                    ..raw_put()
                },
            )
            .await
            .unwrap();
        let doomed = blocks.put(vec![2u8; 100], raw_put()).await.unwrap();

        let removed = blocks.garbage_collect().await.unwrap();
        assert_eq!(removed, 1);
        assert!(blocks.store().exists(&kept.cid).await);
        assert!(!blocks.store().exists(&doomed.cid).await);
    }

    #[tokio::test]
    async fn test_put_verified_rejects_mismatch() {
        let (_dir, blocks) = service().await;
        let honest = Block::compute(b"honest".to_vec(), Codec::Raw, Hasher::Sha2_256, 1).unwrap();

        assert!(blocks.put_verified(&honest.cid, b"dishonest").await.is_err());
        assert!(blocks.put_verified(&honest.cid, b"honest").await.is_ok());
        assert!(blocks.store().exists(&honest.cid).await);
    }

    #[tokio::test]
    async fn test_unknown_codec_is_invalid() {
        // Codec comes in as an enum, so the invalid-argument path is the
        // name parser used by callers
        assert!(Codec::from_name("msgpack").is_err());
    }
}
