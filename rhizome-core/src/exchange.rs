//! Block exchange engine
//!
//! The want-driven coordination layer: broadcasts wanted identifiers to
//! connected peers, answers presence queries, serves and receives blocks, and
//! keeps per-peer accounting ledgers. One reader task per inbound stream, one
//! writer task per peer; the engine itself never blocks on the network.

use cid::Cid;
use futures::future;
use libp2p::core::upgrade::{
    read_length_prefixed, write_length_prefixed, InboundUpgrade, OutboundUpgrade, UpgradeInfo,
};
use libp2p::swarm::{
    handler::{ConnectionEvent, FullyNegotiatedInbound, FullyNegotiatedOutbound},
    ConnectionHandler, ConnectionHandlerEvent, KeepAlive, StreamProtocol, SubstreamProtocol,
};
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};

use crate::content_id::{self, Prefix};
use crate::messages::{
    decode_message, encode_message, BlockMsg, BlockPresence, BlockPresenceType, Message, WantType,
    Wantlist, WantlistEntry,
};
use crate::metrics::Metrics;
use crate::store::{Block, FsBlockStore};
use crate::wantlist::{WantCancelled, WantHandle, WantManager};

pub const PROTOCOL_V120: &str = "/ipfs/bitswap/1.2.0";
pub const PROTOCOL_V110: &str = "/ipfs/bitswap/1.1.0";
pub const PROTOCOL_V100: &str = "/ipfs/bitswap/1.0.0";

/// Ceiling for one wire message.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Exchange protocol generations, newest first. Newer generations add
/// presence queries (HAVE / DONT_HAVE) and per-entry want types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V100,
    V110,
    V120,
}

impl ProtocolVersion {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolVersion::V120 => PROTOCOL_V120,
            ProtocolVersion::V110 => PROTOCOL_V110,
            ProtocolVersion::V100 => PROTOCOL_V100,
        }
    }

    pub fn supports_presences(&self) -> bool {
        matches!(self, ProtocolVersion::V120)
    }

    pub fn from_protocol(protocol: &StreamProtocol) -> Option<Self> {
        match protocol.as_ref() {
            PROTOCOL_V120 => Some(ProtocolVersion::V120),
            PROTOCOL_V110 => Some(ProtocolVersion::V110),
            PROTOCOL_V100 => Some(ProtocolVersion::V100),
            _ => None,
        }
    }
}

/// One row of the protocol table.
#[derive(Debug, Clone)]
pub struct ProtocolSpec {
    pub id: StreamProtocol,
    pub version: ProtocolVersion,
}

/// Supported protocols in preference order; stream negotiation picks the
/// first one the remote also speaks.
pub fn supported_protocols() -> Vec<ProtocolSpec> {
    vec![
        ProtocolSpec {
            id: StreamProtocol::new(PROTOCOL_V120),
            version: ProtocolVersion::V120,
        },
        ProtocolSpec {
            id: StreamProtocol::new(PROTOCOL_V110),
            version: ProtocolVersion::V110,
        },
        ProtocolSpec {
            id: StreamProtocol::new(PROTOCOL_V100),
            version: ProtocolVersion::V100,
        },
    ]
}

/// Per-peer accounting.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub blocks_exchanged: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Ledger {
    /// How much this peer owes us: what we sent over what we got back.
    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_received as f64 + 1.0)
    }
}

struct PeerState {
    tx: mpsc::UnboundedSender<Message>,
    version: ProtocolVersion,
}

/// The exchange engine. Shared behind an `Arc`; every long-lived task holds
/// a clone.
pub struct Exchange {
    store: Arc<FsBlockStore>,
    wants: WantManager,
    peers: RwLock<HashMap<PeerId, PeerState>>,
    ledgers: RwLock<HashMap<PeerId, Ledger>>,
    /// HAVE hints gathered from presence responses.
    presence_hints: RwLock<HashMap<Cid, HashSet<PeerId>>>,
    metrics: Metrics,
}

impl Exchange {
    pub fn new(store: Arc<FsBlockStore>, metrics: Metrics) -> Self {
        Self {
            store,
            wants: WantManager::new(),
            peers: RwLock::new(HashMap::new()),
            ledgers: RwLock::new(HashMap::new()),
            presence_hints: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn wants(&self) -> &WantManager {
        &self.wants
    }

    pub async fn ledger(&self, peer: &PeerId) -> Option<Ledger> {
        self.ledgers.read().await.get(peer).cloned()
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Register a waiter for `cid`. The first waiter triggers a wantlist
    /// broadcast to every connected peer.
    pub async fn want_block(&self, cid: Cid) -> WantHandle {
        let (handle, first) = self.wants.want(cid);
        if first {
            debug!(cid = %cid, "block needed");
            let entry = WantlistEntry {
                block: cid.to_bytes(),
                priority: 1,
                cancel: false,
                want_type: WantType::WantBlock as i32,
                send_dont_have: true,
            };
            self.broadcast(Message {
                wantlist: Some(Wantlist {
                    entries: vec![entry],
                    full: false,
                }),
                ..Default::default()
            })
            .await;
            self.metrics.want_broadcast();
        }
        handle
    }

    /// Want a block and wait for it. Resolves only when a block arrives or
    /// the want is cancelled.
    pub async fn get(self: &Arc<Self>, cid: Cid) -> Result<Block, WantCancelled> {
        self.want_block(cid).await.wait().await
    }

    /// Cancel an entry outright, failing every pending waiter.
    pub fn unwant(&self, cid: &Cid) -> bool {
        self.wants.unwant(cid)
    }

    /// A block became available locally: settle any matching want. Called on
    /// local puts and on receipt from the network.
    pub async fn block_added(&self, block: &Block) {
        let signalled = self.wants.found(block);
        if signalled > 0 {
            trace!(cid = %block.cid, waiters = signalled, "block settled waiters");
        }
        self.presence_hints.write().await.remove(&block.cid);
    }

    /// One fire-and-forget dispatch per connected peer; a dead channel only
    /// skips that peer.
    async fn broadcast(&self, msg: Message) {
        let peers = self.peers.read().await;
        for (peer, state) in peers.iter() {
            if state.tx.send(msg.clone()).is_err() {
                debug!(peer = %peer, "dispatch channel closed, skipping");
            }
        }
    }

    async fn send_to(&self, peer: &PeerId, msg: Message) {
        let peers = self.peers.read().await;
        match peers.get(peer) {
            Some(state) => {
                if state.tx.send(msg).is_err() {
                    debug!(peer = %peer, "dispatch channel closed");
                }
            }
            None => debug!(peer = %peer, "not connected, message dropped"),
        }
    }

    /// A writer stream for `peer` is up. Registers the dispatch channel and
    /// queues the full current wantlist ahead of anything else.
    pub async fn peer_connected(
        &self,
        peer: PeerId,
        version: ProtocolVersion,
        tx: mpsc::UnboundedSender<Message>,
    ) {
        debug!(peer = %peer, protocol = version.name(), "exchange peer connected");
        {
            let mut peers = self.peers.write().await;
            peers.insert(peer, PeerState { tx, version });
        }
        self.ledgers.write().await.entry(peer).or_default();
        self.metrics.peer_connected();

        let wanted = self.wants.wanted();
        if !wanted.is_empty() {
            let entries = wanted
                .into_iter()
                .map(|cid| WantlistEntry {
                    block: cid.to_bytes(),
                    priority: 1,
                    cancel: false,
                    want_type: WantType::WantBlock as i32,
                    send_dont_have: true,
                })
                .collect();
            self.send_to(
                &peer,
                Message {
                    wantlist: Some(Wantlist {
                        entries,
                        full: true,
                    }),
                    ..Default::default()
                },
            )
            .await;
        }
    }

    pub async fn peer_disconnected(&self, peer: PeerId) {
        if self.peers.write().await.remove(&peer).is_some() {
            debug!(peer = %peer, "exchange peer disconnected");
            self.metrics.peer_disconnected();
        }
        self.wants.forget_peer_everywhere(&peer);
        let mut hints = self.presence_hints.write().await;
        for peers in hints.values_mut() {
            peers.remove(&peer);
        }
    }

    /// Which negotiated protocol a peer's writer is using, if connected.
    pub async fn peer_protocol(&self, peer: &PeerId) -> Option<ProtocolVersion> {
        self.peers.read().await.get(peer).map(|s| s.version)
    }

    /// Process one decoded inbound message. Entries are handled in wire
    /// order; nothing here ever propagates an error to the stream.
    pub async fn handle_message(self: &Arc<Self>, peer: PeerId, msg: Message) {
        trace!(
            peer = %peer,
            wantlist = msg.wantlist.is_some(),
            payload = msg.payload.len(),
            presences = msg.block_presences.len(),
            "inbound exchange message"
        );

        if let Some(wantlist) = &msg.wantlist {
            for entry in &wantlist.entries {
                let cid = match Cid::try_from(entry.block.as_slice()) {
                    Ok(cid) => cid,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "undecodable wantlist entry");
                        continue;
                    }
                };
                if entry.cancel {
                    self.wants.forget_peer(&cid, &peer);
                    continue;
                }
                match WantType::try_from(entry.want_type).unwrap_or(WantType::WantBlock) {
                    WantType::WantHave => {
                        self.spawn_presence_probe(peer, cid, entry.send_dont_have);
                    }
                    WantType::WantBlock => {
                        self.spawn_block_serve(peer, cid);
                    }
                }
            }
        }

        for payload in &msg.payload {
            self.process_received_block(&peer, Some(&payload.prefix), &payload.data)
                .await;
        }
        for data in &msg.blocks {
            self.process_received_block(&peer, None, data).await;
        }

        for presence in &msg.block_presences {
            let Ok(cid) = Cid::try_from(presence.cid.as_slice()) else {
                continue;
            };
            match BlockPresenceType::try_from(presence.r#type) {
                Ok(BlockPresenceType::Have) => {
                    trace!(peer = %peer, cid = %cid, "peer has block");
                    self.presence_hints
                        .write()
                        .await
                        .entry(cid)
                        .or_default()
                        .insert(peer);
                }
                Ok(BlockPresenceType::DontHave) => {
                    debug!(peer = %peer, cid = %cid, "peer does not have block");
                }
                Err(_) => {}
            }
        }
    }

    /// Answer a want-have entry with HAVE, or DONT_HAVE when asked for.
    fn spawn_presence_probe(self: &Arc<Self>, peer: PeerId, cid: Cid, send_dont_have: bool) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let have = engine.store.exists(&cid).await;
            if !have && !send_dont_have {
                return;
            }
            let presence = BlockPresence {
                cid: cid.to_bytes(),
                r#type: if have {
                    BlockPresenceType::Have as i32
                } else {
                    BlockPresenceType::DontHave as i32
                },
            };
            engine
                .send_to(
                    &peer,
                    Message {
                        block_presences: vec![presence],
                        ..Default::default()
                    },
                )
                .await;
        });
    }

    /// Serve a want-block entry: locally if possible, otherwise by fetching
    /// through the engine itself. Failures stay inside the task.
    fn spawn_block_serve(self: &Arc<Self>, peer: PeerId, cid: Cid) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let block = match engine.store.try_get(&cid).await {
                Ok(Some(data)) => Block { cid, data },
                Ok(None) => {
                    engine.wants.note_peer(&cid, peer);
                    match engine.get(cid).await {
                        Ok(block) => block,
                        Err(_) => return,
                    }
                }
                Err(e) => {
                    warn!(cid = %cid, error = %e, "store read failed while serving");
                    return;
                }
            };
            engine.send_block(&peer, block).await;
        });
    }

    async fn send_block(&self, peer: &PeerId, block: Block) {
        let size = block.data.len();
        let msg = Message {
            payload: vec![BlockMsg {
                prefix: Prefix::from_cid(&block.cid).to_bytes(),
                data: block.data,
            }],
            ..Default::default()
        };
        self.send_to(peer, msg).await;

        let mut ledgers = self.ledgers.write().await;
        let ledger = ledgers.entry(*peer).or_default();
        ledger.bytes_sent += size as u64;
        ledger.blocks_exchanged += 1;
        self.metrics.block_sent(size);
        debug!(peer = %peer, cid = %block.cid, size, "served block");
    }

    async fn process_received_block(&self, peer: &PeerId, prefix: Option<&[u8]>, data: &[u8]) {
        {
            let mut ledgers = self.ledgers.write().await;
            let ledger = ledgers.entry(*peer).or_default();
            ledger.bytes_received += data.len() as u64;
            ledger.blocks_exchanged += 1;
        }
        self.metrics.block_received(data.len());

        let cid = match prefix {
            Some(prefix_bytes) => match Prefix::from_bytes(prefix_bytes)
                .and_then(|p| p.cid_of(data))
            {
                Ok(cid) => cid,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "undecodable block prefix, dropping");
                    return;
                }
            },
            // 1.0.0 sends bare bytes; reconstruct the default identifier and
            // fall back to a raw v1 if that is what we were waiting for.
            None => {
                let v0 = content_id::cid_for(
                    data,
                    content_id::Codec::DagPb,
                    content_id::Hasher::Sha2_256,
                    0,
                );
                match v0 {
                    Ok(cid) if self.wants.contains(&cid) => cid,
                    _ => match content_id::cid_for(
                        data,
                        content_id::Codec::Raw,
                        content_id::Hasher::Sha2_256,
                        1,
                    ) {
                        Ok(cid) => cid,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "cannot identify legacy block");
                            return;
                        }
                    },
                }
            }
        };

        // Bytes that do not hash to a wanted identifier are dropped on the
        // floor; the want stays active.
        if !self.wants.contains(&cid) {
            debug!(peer = %peer, cid = %cid, "unwanted block discarded");
            self.metrics.unsolicited_block();
            return;
        }

        if self.store.exists(&cid).await {
            self.metrics.duplicate_block();
        } else if let Err(e) = self.store.put(&cid, data).await {
            warn!(cid = %cid, error = %e, "failed to persist received block");
            return;
        }

        self.block_added(&Block {
            cid,
            data: data.to_vec(),
        })
        .await;
    }

    /// Peers that have answered HAVE for `cid`.
    pub async fn holders_of(&self, cid: &Cid) -> Vec<PeerId> {
        self.presence_hints
            .read()
            .await
            .get(cid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Multi-version upgrade: offers every supported protocol id and reports
/// which one was negotiated alongside the stream.
#[derive(Debug, Clone)]
pub struct ExchangeProtocols;

impl UpgradeInfo for ExchangeProtocols {
    type Info = StreamProtocol;
    type InfoIter = std::vec::IntoIter<StreamProtocol>;

    fn protocol_info(&self) -> Self::InfoIter {
        supported_protocols()
            .into_iter()
            .map(|p| p.id)
            .collect::<Vec<_>>()
            .into_iter()
    }
}

impl<C> InboundUpgrade<C> for ExchangeProtocols {
    type Output = (C, StreamProtocol);
    type Error = std::convert::Infallible;
    type Future = future::Ready<Result<Self::Output, Self::Error>>;

    fn upgrade_inbound(self, socket: C, info: Self::Info) -> Self::Future {
        future::ready(Ok((socket, info)))
    }
}

impl<C> OutboundUpgrade<C> for ExchangeProtocols {
    type Output = (C, StreamProtocol);
    type Error = std::convert::Infallible;
    type Future = future::Ready<Result<Self::Output, Self::Error>>;

    fn upgrade_outbound(self, socket: C, info: Self::Info) -> Self::Future {
        future::ready(Ok((socket, info)))
    }
}

/// Connection handler: one per established connection. Requests a single
/// outbound stream for our dispatches and spawns a reader for every inbound
/// stream the remote opens.
pub struct ExchangeHandler {
    peer_id: PeerId,
    engine: Arc<Exchange>,
    keep_alive: KeepAlive,
    outbound_requested: bool,
}

impl ExchangeHandler {
    pub fn new(peer_id: PeerId, engine: Arc<Exchange>) -> Self {
        Self {
            peer_id,
            engine,
            keep_alive: KeepAlive::Yes,
            outbound_requested: false,
        }
    }
}

impl ConnectionHandler for ExchangeHandler {
    type FromBehaviour = ();
    type ToBehaviour = ();
    #[allow(deprecated)]
    type Error = io::Error;
    type InboundProtocol = ExchangeProtocols;
    type OutboundProtocol = ExchangeProtocols;
    type InboundOpenInfo = ();
    type OutboundOpenInfo = ();

    fn listen_protocol(&self) -> SubstreamProtocol<Self::InboundProtocol, Self::InboundOpenInfo> {
        SubstreamProtocol::new(ExchangeProtocols, ())
    }

    fn on_behaviour_event(&mut self, _event: Self::FromBehaviour) {}

    fn connection_keep_alive(&self) -> KeepAlive {
        self.keep_alive
    }

    #[allow(deprecated)]
    fn poll(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<
        ConnectionHandlerEvent<
            Self::OutboundProtocol,
            Self::OutboundOpenInfo,
            Self::ToBehaviour,
            Self::Error,
        >,
    > {
        if !self.outbound_requested {
            self.outbound_requested = true;
            return std::task::Poll::Ready(ConnectionHandlerEvent::OutboundSubstreamRequest {
                protocol: SubstreamProtocol::new(ExchangeProtocols, ()),
            });
        }
        std::task::Poll::Pending
    }

    fn on_connection_event(
        &mut self,
        event: ConnectionEvent<
            Self::InboundProtocol,
            Self::OutboundProtocol,
            Self::InboundOpenInfo,
            Self::OutboundOpenInfo,
        >,
    ) {
        match event {
            ConnectionEvent::FullyNegotiatedInbound(FullyNegotiatedInbound {
                protocol: (stream, negotiated),
                ..
            }) => {
                let peer_id = self.peer_id;
                let engine = self.engine.clone();
                debug!(peer = %peer_id, protocol = %negotiated, "inbound exchange stream");

                tokio::spawn(async move {
                    let mut stream = stream;
                    loop {
                        match read_length_prefixed(&mut stream, MAX_MESSAGE_SIZE).await {
                            Ok(data) => match decode_message(&data) {
                                Ok(msg) => engine.handle_message(peer_id, msg).await,
                                Err(e) => {
                                    // A decode error poisons the stream, not
                                    // the engine
                                    warn!(peer = %peer_id, error = %e, "stream decode error");
                                    break;
                                }
                            },
                            Err(e) => {
                                if e.kind() != io::ErrorKind::UnexpectedEof {
                                    warn!(peer = %peer_id, error = %e, "stream read error");
                                }
                                break;
                            }
                        }
                    }
                    trace!(peer = %peer_id, "inbound exchange stream closed");
                });
            }
            ConnectionEvent::FullyNegotiatedOutbound(FullyNegotiatedOutbound {
                protocol: (stream, negotiated),
                ..
            }) => {
                let peer_id = self.peer_id;
                let engine = self.engine.clone();
                let version =
                    ProtocolVersion::from_protocol(&negotiated).unwrap_or(ProtocolVersion::V100);
                debug!(peer = %peer_id, protocol = %negotiated, "outbound exchange stream");

                let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
                tokio::spawn(async move {
                    engine.peer_connected(peer_id, version, tx).await;

                    let mut stream = stream;
                    while let Some(msg) = rx.recv().await {
                        let msg = msg.downgrade_for(version);
                        if msg.is_empty() {
                            continue;
                        }
                        let bytes = match encode_message(&msg) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(peer = %peer_id, error = %e, "message encode failed");
                                continue;
                            }
                        };
                        if let Err(e) = write_length_prefixed(&mut stream, &bytes).await {
                            warn!(peer = %peer_id, error = %e, "stream write failed");
                            break;
                        }
                    }

                    engine.peer_disconnected(peer_id).await;
                });
            }
            ConnectionEvent::DialUpgradeError(err) => {
                // The remote speaks none of our protocol generations
                warn!(peer = %self.peer_id, error = ?err.error, "exchange negotiation failed");
            }
            ConnectionEvent::AddressChange(_)
            | ConnectionEvent::ListenUpgradeError(_)
            | ConnectionEvent::LocalProtocolsChange(_)
            | ConnectionEvent::RemoteProtocolsChange(_) => {}
        }
    }
}

/// Network behaviour installing the exchange handler on every connection.
pub struct ExchangeBehaviour {
    engine: Arc<Exchange>,
}

impl ExchangeBehaviour {
    pub fn new(engine: Arc<Exchange>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> Arc<Exchange> {
        self.engine.clone()
    }
}

impl libp2p::swarm::NetworkBehaviour for ExchangeBehaviour {
    type ConnectionHandler = ExchangeHandler;
    type ToSwarm = ();

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: libp2p::swarm::ConnectionId,
        peer: PeerId,
        _local_addr: &libp2p::Multiaddr,
        _remote_addr: &libp2p::Multiaddr,
    ) -> Result<libp2p::swarm::THandler<Self>, libp2p::swarm::ConnectionDenied> {
        Ok(ExchangeHandler::new(peer, self.engine.clone()))
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: libp2p::swarm::ConnectionId,
        peer: PeerId,
        _addr: &libp2p::Multiaddr,
        _role_override: libp2p::core::Endpoint,
    ) -> Result<libp2p::swarm::THandler<Self>, libp2p::swarm::ConnectionDenied> {
        Ok(ExchangeHandler::new(peer, self.engine.clone()))
    }

    fn on_swarm_event(&mut self, event: libp2p::swarm::FromSwarm<Self::ConnectionHandler>) {
        if let libp2p::swarm::FromSwarm::ConnectionClosed(closed) = event {
            if closed.remaining_established == 0 {
                let engine = self.engine.clone();
                let peer = closed.peer_id;
                tokio::spawn(async move {
                    engine.peer_disconnected(peer).await;
                });
            }
        }
    }

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: libp2p::swarm::ConnectionId,
        _event: libp2p::swarm::THandlerOutEvent<Self>,
    ) {
    }

    fn poll(
        &mut self,
        _cx: &mut std::task::Context<'_>,
        _params: &mut impl libp2p::swarm::PollParameters,
    ) -> std::task::Poll<libp2p::swarm::ToSwarm<Self::ToSwarm, libp2p::swarm::THandlerInEvent<Self>>>
    {
        std::task::Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_id::{Codec, Hasher};
    use std::time::Duration;

    async fn test_engine() -> (tempfile::TempDir, Arc<Exchange>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsBlockStore::open(dir.path().join("blocks")).await.unwrap());
        let engine = Arc::new(Exchange::new(store, Metrics::new()));
        (dir, engine)
    }

    fn test_block(data: &[u8]) -> Block {
        Block::compute(data.to_vec(), Codec::Raw, Hasher::Sha2_256, 1).unwrap()
    }

    fn payload_for(block: &Block) -> Message {
        Message {
            payload: vec![BlockMsg {
                prefix: Prefix::from_cid(&block.cid).to_bytes(),
                data: block.data.clone(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_want_broadcasts_to_connected_peer() {
        let (_dir, engine) = test_engine().await;
        let peer = PeerId::random();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .peer_connected(peer, ProtocolVersion::V120, tx)
            .await;

        let block = test_block(b"broadcast me");
        let _handle = engine.want_block(block.cid).await;

        let msg = rx.recv().await.unwrap();
        let wl = msg.wantlist.unwrap();
        assert_eq!(wl.entries.len(), 1);
        assert_eq!(wl.entries[0].block, block.cid.to_bytes());
        assert!(!wl.entries[0].cancel);
    }

    #[tokio::test]
    async fn test_wantlist_sent_on_connect() {
        let (_dir, engine) = test_engine().await;
        let block = test_block(b"wanted before connect");
        let _handle = engine.want_block(block.cid).await;

        let peer = PeerId::random();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .peer_connected(peer, ProtocolVersion::V120, tx)
            .await;

        let msg = rx.recv().await.unwrap();
        let wl = msg.wantlist.unwrap();
        assert!(wl.full);
        assert_eq!(wl.entries[0].block, block.cid.to_bytes());
    }

    #[tokio::test]
    async fn test_received_block_settles_waiter_and_ledger() {
        let (_dir, engine) = test_engine().await;
        let peer = PeerId::random();
        let block = test_block(b"delivered goods");

        let handle = engine.want_block(block.cid).await;
        engine.handle_message(peer, payload_for(&block)).await;

        let received = handle.wait().await.unwrap();
        assert_eq!(received.data, block.data);
        assert!(engine.wants().is_empty());
        assert!(engine.store.exists(&block.cid).await);

        let ledger = engine.ledger(&peer).await.unwrap();
        assert!(ledger.bytes_received >= block.data.len() as u64);
        assert_eq!(ledger.blocks_exchanged, 1);
    }

    #[tokio::test]
    async fn test_mishashed_block_dropped_want_stays() {
        let (_dir, engine) = test_engine().await;
        let peer = PeerId::random();
        let block = test_block(b"the real bytes");

        let _handle = engine.want_block(block.cid).await;

        // Same prefix, different bytes: hashes to a different identifier
        let forged = Message {
            payload: vec![BlockMsg {
                prefix: Prefix::from_cid(&block.cid).to_bytes(),
                data: b"forged bytes".to_vec(),
            }],
            ..Default::default()
        };
        engine.handle_message(peer, forged).await;

        assert!(engine.wants().contains(&block.cid));
        assert!(!engine.store.exists(&block.cid).await);
    }

    #[tokio::test]
    async fn test_cancel_leaves_wants_empty() {
        let (_dir, engine) = test_engine().await;
        let block = test_block(b"never mind");

        let handle = engine.want_block(block.cid).await;
        assert_eq!(engine.wants().len(), 1);
        drop(handle);
        assert!(engine.wants().is_empty());
    }

    #[tokio::test]
    async fn test_want_block_entry_served_from_store() {
        let (_dir, engine) = test_engine().await;
        let block = test_block(b"on the shelf");
        engine.store.put(&block.cid, &block.data).await.unwrap();

        let peer = PeerId::random();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .peer_connected(peer, ProtocolVersion::V120, tx)
            .await;

        let want = Message {
            wantlist: Some(Wantlist {
                entries: vec![WantlistEntry {
                    block: block.cid.to_bytes(),
                    priority: 1,
                    cancel: false,
                    want_type: WantType::WantBlock as i32,
                    send_dont_have: false,
                }],
                full: false,
            }),
            ..Default::default()
        };
        engine.handle_message(peer, want).await;

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload.len(), 1);
        assert_eq!(msg.payload[0].data, block.data);

        let ledger = engine.ledger(&peer).await.unwrap();
        assert_eq!(ledger.bytes_sent, block.data.len() as u64);
    }

    #[tokio::test]
    async fn test_want_have_answered_with_presence() {
        let (_dir, engine) = test_engine().await;
        let held = test_block(b"present");
        let missing = test_block(b"absent");
        engine.store.put(&held.cid, &held.data).await.unwrap();

        let peer = PeerId::random();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .peer_connected(peer, ProtocolVersion::V120, tx)
            .await;

        let probe = |cid: &Cid| WantlistEntry {
            block: cid.to_bytes(),
            priority: 1,
            cancel: false,
            want_type: WantType::WantHave as i32,
            send_dont_have: true,
        };
        engine
            .handle_message(
                peer,
                Message {
                    wantlist: Some(Wantlist {
                        entries: vec![probe(&held.cid), probe(&missing.cid)],
                        full: false,
                    }),
                    ..Default::default()
                },
            )
            .await;

        let mut have = 0;
        let mut dont_have = 0;
        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            for presence in msg.block_presences {
                match BlockPresenceType::try_from(presence.r#type).unwrap() {
                    BlockPresenceType::Have => have += 1,
                    BlockPresenceType::DontHave => dont_have += 1,
                }
            }
        }
        assert_eq!(have, 1);
        assert_eq!(dont_have, 1);
    }

    #[tokio::test]
    async fn test_peer_cancel_drops_interest_not_waiters() {
        let (_dir, engine) = test_engine().await;
        let peer = PeerId::random();
        let block = test_block(b"still wanted here");

        let _handle = engine.want_block(block.cid).await;
        engine.wants().note_peer(&block.cid, peer);

        let cancel = Message {
            wantlist: Some(Wantlist {
                entries: vec![WantlistEntry {
                    block: block.cid.to_bytes(),
                    priority: 0,
                    cancel: true,
                    want_type: WantType::WantBlock as i32,
                    send_dont_have: false,
                }],
                full: false,
            }),
            ..Default::default()
        };
        engine.handle_message(peer, cancel).await;

        // Our own want survives a remote cancel
        assert!(engine.wants().contains(&block.cid));
        assert!(engine.wants().peers_for(&block.cid).is_empty());
    }

    #[tokio::test]
    async fn test_presence_hints_recorded() {
        let (_dir, engine) = test_engine().await;
        let peer = PeerId::random();
        let block = test_block(b"rumoured");

        engine
            .handle_message(
                peer,
                Message {
                    block_presences: vec![BlockPresence {
                        cid: block.cid.to_bytes(),
                        r#type: BlockPresenceType::Have as i32,
                    }],
                    ..Default::default()
                },
            )
            .await;

        assert_eq!(engine.holders_of(&block.cid).await, vec![peer]);

        engine.peer_disconnected(peer).await;
        assert!(engine.holders_of(&block.cid).await.is_empty());
    }

    #[tokio::test]
    async fn test_local_block_added_settles_network_race() {
        let (_dir, engine) = test_engine().await;
        let block = test_block(b"won locally");

        let handle = engine.want_block(block.cid).await;
        engine.store.put(&block.cid, &block.data).await.unwrap();
        engine.block_added(&block).await;

        assert_eq!(handle.wait().await.unwrap(), block);

        // A late network copy of the same block is a no-op
        engine.handle_message(PeerId::random(), payload_for(&block)).await;
        assert!(engine.wants().is_empty());
    }

    #[test]
    fn test_protocol_table_descending() {
        let protocols = supported_protocols();
        assert_eq!(protocols.len(), 3);
        assert_eq!(protocols[0].version, ProtocolVersion::V120);
        assert_eq!(protocols[1].version, ProtocolVersion::V110);
        assert_eq!(protocols[2].version, ProtocolVersion::V100);
        assert!(protocols[0].version > protocols[2].version);
    }

    #[test]
    fn test_ledger_debt_ratio() {
        let ledger = Ledger {
            blocks_exchanged: 2,
            bytes_sent: 100,
            bytes_received: 0,
        };
        assert!(ledger.debt_ratio() > 99.0);

        let settled = Ledger {
            blocks_exchanged: 2,
            bytes_sent: 100,
            bytes_received: 100,
        };
        assert!(settled.debt_ratio() < 1.0);
    }
}
