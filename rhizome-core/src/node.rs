//! Node lifecycle
//!
//! Wires the repository, block store, exchange engine, routing and name
//! system together, runs the swarm event loop, and owns the background
//! discovery walker. Everything spawned here swallows its own errors after
//! logging; failures surface to callers only through the operation APIs.

use cid::Cid;
use futures::StreamExt;
use libp2p::swarm::SwarmEvent;
use libp2p::{identity, Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::blocks::{BlockService, BlockStat};
use crate::config::NodeConfig;
use crate::content_id::INLINE_LIMIT;
use crate::dag::{read_file, AddOptions, DagBuilder, DagError};
use crate::exchange::Exchange;
use crate::ipns::{DnsLink, NameError, NameSystem};
use crate::keys::{KeyError, Keystore, MemoryKeystore};
use crate::metrics::Metrics;
use crate::migrations::{MigrationError, Migrator, CURRENT_REPO_VERSION};
use crate::p2p::{create_swarm, P2PError};
use crate::pin::{PinError, PinStore};
use crate::pubsub::{MemoryPubSub, PubSub};
use crate::repo::{FsRepo, RepoError};
use crate::routing::{Dht, MemoryDht, Routing};
use crate::store::{FsBlockStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pin(#[from] PinError),

    #[error(transparent)]
    P2P(#[from] P2PError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Requests routed to the swarm event loop from other tasks.
#[derive(Debug)]
pub enum NodeCommand {
    /// Dial a peer, by address when known, by identity otherwise.
    Dial(PeerId, Vec<Multiaddr>),
    /// Dial a bare multiaddress.
    DialAddr(Multiaddr),
}

/// External collaborators a node runs against. Defaults are the in-process
/// implementations, which keep a standalone node fully functional.
pub struct Collaborators {
    pub dht: Option<Arc<dyn Dht>>,
    pub pubsub: Option<Arc<dyn PubSub>>,
    pub keystore: Option<Arc<dyn Keystore>>,
    pub dns: Option<Arc<dyn DnsLink>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            dht: None,
            pubsub: None,
            keystore: None,
            dns: None,
        }
    }
}

/// A running node.
pub struct Node {
    peer_id: PeerId,
    repo: Arc<FsRepo>,
    blocks: Arc<BlockService>,
    names: Arc<NameSystem>,
    routing: Arc<Routing>,
    exchange: Arc<Exchange>,
    keystore: Arc<dyn Keystore>,
    metrics: Metrics,
    commands: mpsc::UnboundedSender<NodeCommand>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Node {
    /// Open (and migrate) the repository, start the swarm and background
    /// tasks, and return the running node.
    pub async fn start(config: NodeConfig, collaborators: Collaborators) -> Result<Self, NodeError> {
        let repo = Arc::new(FsRepo::open(&config.repo_dir).await?);
        Migrator::standard()
            .migrate_to(&repo, CURRENT_REPO_VERSION)
            .await?;

        let metrics = Metrics::new();
        let store = Arc::new(FsBlockStore::open(repo.blocks_dir()).await?);
        let pins = Arc::new(PinStore::open(repo.pins_dir()).await?);
        let exchange = Arc::new(Exchange::new(store.clone(), metrics.clone()));

        let keypair = identity::Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());

        let keystore: Arc<dyn Keystore> = match collaborators.keystore {
            Some(keystore) => keystore,
            None => {
                let keystore = MemoryKeystore::new();
                if let Ok(ed) = keypair.clone().try_into_ed25519() {
                    keystore.insert("self", ed).await;
                }
                Arc::new(keystore)
            }
        };
        let dht: Arc<dyn Dht> = collaborators
            .dht
            .unwrap_or_else(|| Arc::new(MemoryDht::new(peer_id)));
        let pubsub: Arc<dyn PubSub> = collaborators
            .pubsub
            .unwrap_or_else(|| Arc::new(MemoryPubSub::new()));

        let routing = Arc::new(Routing::new(dht));
        let blocks = Arc::new(BlockService::new(
            store,
            pins,
            exchange.clone(),
            routing.clone(),
            Some(INLINE_LIMIT),
        ));
        let names = Arc::new(
            NameSystem::open(
                keystore.clone(),
                routing.clone(),
                pubsub,
                collaborators.dns,
                repo.seq_path(),
            )
            .await?,
        );

        let mut swarm = create_swarm(keypair, exchange.clone())?;
        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
            .parse()
            .map_err(|e| NodeError::Config(format!("listen address: {e}")))?;
        swarm
            .listen_on(listen)
            .map_err(|e| NodeError::Config(format!("listen failed: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        blocks.set_online(cmd_tx.clone());

        let listen_addrs = Arc::new(RwLock::new(Vec::new()));
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::event_loop(
            swarm,
            cmd_rx,
            listen_addrs.clone(),
        )));

        if config.discovery_interval > 0 {
            tasks.push(tokio::spawn(Self::discovery_walk(
                routing.clone(),
                Duration::from_secs(config.discovery_interval),
            )));
        }

        // Bootstrap peers come from the repo config plus the command line
        let repo_config = repo.read_config().await?;
        for addr in repo_config.bootstrap.iter().chain(config.bootstrap.iter()) {
            match addr.parse::<Multiaddr>() {
                Ok(addr) => {
                    let _ = cmd_tx.send(NodeCommand::DialAddr(addr));
                }
                Err(e) => warn!(addr, error = %e, "skipping invalid bootstrap address"),
            }
        }

        info!(peer = %peer_id, repo = %config.repo_dir.display(), "node started");
        Ok(Self {
            peer_id,
            repo,
            blocks,
            names,
            routing,
            exchange,
            keystore,
            metrics,
            commands: cmd_tx,
            listen_addrs,
            tasks: Mutex::new(tasks),
        })
    }

    async fn event_loop(
        mut swarm: libp2p::Swarm<crate::exchange::ExchangeBehaviour>,
        mut commands: mpsc::UnboundedReceiver<NodeCommand>,
        listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    ) {
        loop {
            tokio::select! {
                event = swarm.select_next_some() => match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(address = %address, "listening");
                        listen_addrs.write().await.push(address);
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                        info!(peer = %peer_id, address = %endpoint.get_remote_address(), "connected");
                    }
                    SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                        debug!(peer = %peer_id, cause = ?cause, "connection closed");
                    }
                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        debug!(peer = ?peer_id, error = %error, "outgoing connection failed");
                    }
                    SwarmEvent::IncomingConnectionError { send_back_addr, error, .. } => {
                        debug!(address = %send_back_addr, error = %error, "incoming connection failed");
                    }
                    _ => {}
                },
                command = commands.recv() => match command {
                    Some(NodeCommand::Dial(peer, addrs)) => {
                        if addrs.is_empty() {
                            if let Err(e) = swarm.dial(peer) {
                                debug!(peer = %peer, error = %e, "dial failed");
                            }
                        } else {
                            for addr in addrs {
                                if let Err(e) = swarm.dial(addr.clone()) {
                                    debug!(peer = %peer, address = %addr, error = %e, "dial failed");
                                }
                            }
                        }
                    }
                    Some(NodeCommand::DialAddr(addr)) => {
                        if let Err(e) = swarm.dial(addr.clone()) {
                            debug!(address = %addr, error = %e, "dial failed");
                        }
                    }
                    None => break,
                },
            }
        }
        trace!("event loop stopped");
    }

    /// Periodic random-identity walk keeping the routing tables warm. Every
    /// failure is expected and logged at trace.
    async fn discovery_walk(routing: Arc<Routing>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let target = PeerId::random();
            match routing.find_peer(&target).await {
                Ok(addrs) => trace!(peer = %target, found = addrs.len(), "walk hit"),
                Err(e) => trace!(peer = %target, error = %e, "walk miss"),
            }
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn repo(&self) -> &Arc<FsRepo> {
        &self.repo
    }

    pub fn blocks(&self) -> &Arc<BlockService> {
        &self.blocks
    }

    pub fn names(&self) -> &Arc<NameSystem> {
        &self.names
    }

    pub fn routing(&self) -> &Arc<Routing> {
        &self.routing
    }

    pub fn exchange(&self) -> &Arc<Exchange> {
        &self.exchange
    }

    pub fn keystore(&self) -> &Arc<dyn Keystore> {
        &self.keystore
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.read().await.clone()
    }

    /// Dial a remote multiaddress.
    pub fn connect(&self, addr: Multiaddr) {
        let _ = self.commands.send(NodeCommand::DialAddr(addr));
    }

    /// Import bytes as a file DAG with the given options.
    pub async fn add_bytes(&self, data: &[u8], opts: &AddOptions) -> Result<BlockStat, DagError> {
        DagBuilder::new(self.blocks.clone(), Some(self.keystore.clone()))
            .add_bytes(data, opts)
            .await
    }

    /// Import text with default options.
    pub async fn add_text(&self, text: &str) -> Result<BlockStat, DagError> {
        self.add_bytes(text.as_bytes(), &AddOptions::default()).await
    }

    /// Read a whole file DAG back into memory.
    pub async fn read_all_bytes(&self, cid: &Cid) -> Result<Vec<u8>, DagError> {
        read_file(&self.blocks, Some(&self.keystore), None, cid).await
    }

    pub async fn read_all_text(&self, cid: &Cid) -> Result<String, DagError> {
        let bytes = self.read_all_bytes(cid).await?;
        String::from_utf8(bytes).map_err(|e| DagError::InvalidNode(e.to_string()))
    }

    /// Stop background tasks and take the node offline.
    pub async fn stop(&self) {
        self.blocks.set_offline();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(peer = %self.peer_id, "node stopped");
    }
}
