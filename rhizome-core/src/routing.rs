//! Routing facade over the distributed hash table
//!
//! The DHT algorithm itself is an external collaborator behind the `Dht`
//! trait; the facade only validates key shapes and dispatches. `MemoryDht`
//! is the in-process table used offline and in tests.

use async_trait::async_trait;
use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Invalid routing key: {0}")]
    InvalidKey(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Routing failure: {0}")]
    Dht(String),
}

/// A peer known to hold a given block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// The DHT operations the core consumes.
#[async_trait]
pub trait Dht: Send + Sync {
    async fn find_peer(&self, peer: &PeerId) -> Result<Vec<Multiaddr>, RoutingError>;

    async fn find_providers(&self, cid: &Cid, limit: usize)
        -> Result<Vec<Provider>, RoutingError>;

    /// Announce that this node holds `cid`. With `advertise` unset the record
    /// is kept local.
    async fn provide(&self, cid: &Cid, advertise: bool) -> Result<(), RoutingError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, RoutingError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), RoutingError>;
}

/// Keys handled at this layer are `/ipns/<id>` or `/pk/<id>` only.
fn check_key(key: &str) -> Result<(), RoutingError> {
    let rest = key
        .strip_prefix("/ipns/")
        .or_else(|| key.strip_prefix("/pk/"));
    match rest {
        Some(id) if !id.is_empty() && !id.contains('/') => Ok(()),
        _ => Err(RoutingError::InvalidKey(key.to_string())),
    }
}

/// Thin dispatch layer in front of the DHT.
pub struct Routing {
    dht: std::sync::Arc<dyn Dht>,
}

impl Routing {
    pub fn new(dht: std::sync::Arc<dyn Dht>) -> Self {
        Self { dht }
    }

    pub async fn find_peer(&self, peer: &PeerId) -> Result<Vec<Multiaddr>, RoutingError> {
        self.dht.find_peer(peer).await
    }

    /// Look up providers, feeding each one to `on_each` as it is returned.
    pub async fn find_providers(
        &self,
        cid: &Cid,
        limit: usize,
        mut on_each: impl FnMut(&Provider) + Send,
    ) -> Result<Vec<Provider>, RoutingError> {
        let providers = self.dht.find_providers(cid, limit).await?;
        for provider in &providers {
            on_each(provider);
        }
        Ok(providers)
    }

    pub async fn provide(&self, cid: &Cid, advertise: bool) -> Result<(), RoutingError> {
        debug!(cid = %cid, advertise, "providing");
        self.dht.provide(cid, advertise).await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, RoutingError> {
        check_key(key)?;
        self.dht.get(key).await
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), RoutingError> {
        check_key(key)?;
        self.dht.put(key, value).await
    }

    /// Publish a key with an empty value, for callers that only need the
    /// record to exist.
    pub async fn announce(&self, key: &str) -> Result<(), RoutingError> {
        self.put(key, &[]).await
    }
}

/// In-process DHT: a provider table plus a key/value map.
pub struct MemoryDht {
    providers: RwLock<HashMap<Cid, Vec<Provider>>>,
    records: RwLock<HashMap<String, Vec<u8>>>,
    peers: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    local: Provider,
}

impl MemoryDht {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            local: Provider {
                peer: local_peer,
                addrs: Vec::new(),
            },
        }
    }

    /// Seed a provider record, as a remote announcement would.
    pub async fn add_provider(&self, cid: Cid, provider: Provider) {
        self.providers.write().await.entry(cid).or_default().push(provider);
    }

    /// Seed a peer's addresses.
    pub async fn add_peer(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        self.peers.write().await.insert(peer, addrs);
    }
}

#[async_trait]
impl Dht for MemoryDht {
    async fn find_peer(&self, peer: &PeerId) -> Result<Vec<Multiaddr>, RoutingError> {
        self.peers
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or_else(|| RoutingError::NotFound(peer.to_string()))
    }

    async fn find_providers(
        &self,
        cid: &Cid,
        limit: usize,
    ) -> Result<Vec<Provider>, RoutingError> {
        let providers = self.providers.read().await;
        let mut found = providers.get(cid).cloned().unwrap_or_default();
        found.truncate(limit);
        Ok(found)
    }

    async fn provide(&self, cid: &Cid, advertise: bool) -> Result<(), RoutingError> {
        if advertise {
            self.providers
                .write()
                .await
                .entry(*cid)
                .or_default()
                .push(self.local.clone());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, RoutingError> {
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RoutingError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), RoutingError> {
        self.records
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
