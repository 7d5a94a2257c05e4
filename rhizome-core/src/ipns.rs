//! Mutable name records
//!
//! Signed, sequence-numbered records mapping a publishing key to a content
//! path. Published through the routing layer and fanned out over pub/sub;
//! admitted records must carry a strictly increasing sequence per publisher,
//! and that replay barrier is persisted so it survives cache eviction and
//! restarts.

use async_trait::async_trait;
use base64::Engine;
use libp2p::identity::PublicKey;
use libp2p::PeerId;
use prost::Message as ProstMessage;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::keys::{verify_signature, KeyError, Keystore};
use crate::pubsub::PubSub;
use crate::routing::{Routing, RoutingError};

/// Maximum `/ipns/` hops a recursive resolve follows.
const MAX_RESOLVE_DEPTH: usize = 8;

/// The only validity scheme in use: the record dies at a fixed instant.
pub const VALIDITY_EOL: i32 = 0;

const SIGNATURE_V2_PREFIX: &[u8] = b"rhizome-record:";

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("Name not resolvable: {0}")]
    NotFound(String),

    #[error("Stale record for {peer}: sequence {got} <= {max}")]
    Stale { peer: String, got: u64, max: u64 },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Record expired at {0}")]
    Expired(String),

    #[error("DNS link resolution is not available")]
    DnsUnavailable,

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire form of a name record.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NameRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,

    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,

    #[prost(int32, tag = "3")]
    pub validity_type: i32,

    /// ASCII RFC 3339 timestamp with a trailing `Z`.
    #[prost(bytes = "vec", tag = "4")]
    pub validity: Vec<u8>,

    #[prost(uint64, tag = "5")]
    pub sequence: u64,

    #[prost(uint64, tag = "6")]
    pub ttl: u64,

    #[prost(bytes = "vec", tag = "7")]
    pub pub_key: Vec<u8>,

    #[prost(bytes = "vec", tag = "8")]
    pub signature_v2: Vec<u8>,

    #[prost(bytes = "vec", tag = "9")]
    pub data: Vec<u8>,
}

/// Canonical blob covered by the v2 signature.
#[derive(Debug, Serialize, Deserialize)]
struct RecordData {
    value: Vec<u8>,
    validity: Vec<u8>,
    validity_type: i32,
    sequence: u64,
    ttl: u64,
}

/// Bytes covered by the v1 signature.
fn signing_bytes(value: &[u8], validity: &[u8], validity_type: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + validity.len() + 8);
    out.extend_from_slice(value);
    out.extend_from_slice(validity);
    out.extend_from_slice(&(validity_type as u64).to_be_bytes());
    out
}

/// Pub/sub topic for one publisher's records.
pub fn record_topic(peer: &PeerId) -> String {
    let mut key = b"/ipns/".to_vec();
    key.extend_from_slice(&peer.to_bytes());
    format!(
        "/record/{}",
        base64::engine::general_purpose::URL_SAFE.encode(key)
    )
}

/// Append-only persisted table of the highest admitted sequence per
/// publisher.
struct SequenceTable {
    path: PathBuf,
    max_seen: HashMap<String, u64>,
}

impl SequenceTable {
    async fn load(path: PathBuf) -> Result<Self, NameError> {
        let mut max_seen = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(body) => {
                for line in body.lines() {
                    let mut parts = line.split_whitespace();
                    let (Some(peer), Some(seq)) = (parts.next(), parts.next()) else {
                        continue;
                    };
                    let Ok(seq) = seq.parse::<u64>() else {
                        warn!(line, "skipping unparseable sequence entry");
                        continue;
                    };
                    let entry = max_seen.entry(peer.to_string()).or_insert(0u64);
                    *entry = (*entry).max(seq);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self { path, max_seen })
    }

    fn max_for(&self, peer: &str) -> Option<u64> {
        self.max_seen.get(peer).copied()
    }

    /// Record a newly admitted sequence, appending to the on-disk log.
    async fn record(&mut self, peer: &str, seq: u64) -> Result<(), NameError> {
        self.max_seen.insert(peer.to_string(), seq);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{peer} {seq}\n").as_bytes()).await?;
        Ok(())
    }
}

struct CachedRecord {
    record: NameRecord,
    value: String,
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedName {
    /// `/ipns/<peer>`
    pub name: String,
    /// The path the name now points at.
    pub value: String,
}

/// Optional DNS link collaborator: dotted names delegate here.
#[async_trait]
pub trait DnsLink: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<String, NameError>;
}

/// The name record manager.
pub struct NameSystem {
    keystore: Arc<dyn Keystore>,
    routing: Arc<Routing>,
    pubsub: Arc<dyn PubSub>,
    dns: Option<Arc<dyn DnsLink>>,
    cache: RwLock<HashMap<String, CachedRecord>>,
    seqs: Mutex<SequenceTable>,
    subscribed: Mutex<HashSet<String>>,
}

impl NameSystem {
    pub async fn open(
        keystore: Arc<dyn Keystore>,
        routing: Arc<Routing>,
        pubsub: Arc<dyn PubSub>,
        dns: Option<Arc<dyn DnsLink>>,
        seq_path: PathBuf,
    ) -> Result<Self, NameError> {
        Ok(Self {
            keystore,
            routing,
            pubsub,
            dns,
            cache: RwLock::new(HashMap::new()),
            seqs: Mutex::new(SequenceTable::load(seq_path).await?),
            subscribed: Mutex::new(HashSet::new()),
        })
    }

    /// Highest admitted sequence for a publisher, if any.
    pub async fn max_sequence(&self, peer: &str) -> Option<u64> {
        self.seqs.lock().await.max_for(peer)
    }

    /// The replay barrier: a record whose sequence does not exceed the
    /// stored maximum is rejected; an admitted one raises the maximum and
    /// is persisted.
    pub async fn admit(&self, peer: &str, record: &NameRecord) -> Result<(), NameError> {
        self.verify_record(peer, record)?;
        let mut seqs = self.seqs.lock().await;
        let max = seqs.max_for(peer).unwrap_or(0);
        if record.sequence <= max && seqs.max_for(peer).is_some() {
            return Err(NameError::Stale {
                peer: peer.to_string(),
                got: record.sequence,
                max,
            });
        }
        seqs.record(peer, record.sequence).await?;
        drop(seqs);

        let value = String::from_utf8_lossy(&record.value).into_owned();
        self.cache.write().await.insert(
            peer.to_string(),
            CachedRecord {
                record: record.clone(),
                value,
            },
        );
        debug!(peer, sequence = record.sequence, "admitted name record");
        Ok(())
    }

    fn verify_record(&self, peer: &str, record: &NameRecord) -> Result<(), NameError> {
        let key_bytes = if !record.pub_key.is_empty() {
            record.pub_key.clone()
        } else {
            // ed25519 peer ids embed the key in an identity multihash
            let parsed: PeerId = peer
                .parse()
                .map_err(|_| NameError::InvalidRecord(format!("bad peer id {peer}")))?;
            let mh = multihash::Multihash::<64>::from_bytes(&parsed.to_bytes())
                .map_err(|_| NameError::InvalidRecord(format!("bad peer id {peer}")))?;
            if mh.code() != 0 {
                return Err(NameError::InvalidRecord(
                    "record carries no verifiable key".into(),
                ));
            }
            mh.digest().to_vec()
        };

        if !record.pub_key.is_empty() {
            // An embedded key must actually belong to the name
            if let Ok(key) = PublicKey::try_decode_protobuf(&key_bytes) {
                if let Ok(parsed) = peer.parse::<PeerId>() {
                    if key.to_peer_id() != parsed {
                        return Err(NameError::InvalidRecord(
                            "embedded key does not match the name".into(),
                        ));
                    }
                }
            }
        }

        let signed = signing_bytes(&record.value, &record.validity, record.validity_type);
        if !verify_signature(&key_bytes, &signed, &record.signature) {
            return Err(NameError::InvalidRecord("signature check failed".into()));
        }
        Ok(())
    }

    fn check_validity(record: &NameRecord) -> Result<(), NameError> {
        let text = std::str::from_utf8(&record.validity)
            .map_err(|_| NameError::InvalidRecord("non-ASCII validity".into()))?;
        let eol = OffsetDateTime::parse(text, &Rfc3339)
            .map_err(|_| NameError::InvalidRecord(format!("unparseable validity {text:?}")))?;
        if eol < OffsetDateTime::now_utc() {
            return Err(NameError::Expired(text.to_string()));
        }
        Ok(())
    }

    /// Sign and publish a new record pointing `key_name` at `path`.
    pub async fn publish(
        self: &Arc<Self>,
        path: &str,
        key_name: &str,
        lifetime: Duration,
    ) -> Result<PublishedName, NameError> {
        let key = self.keystore.find_key_by_name(key_name).await?;
        let peer = key.peer_id.to_string();

        let sequence = self.max_sequence(&peer).await.unwrap_or(0).max(0) + 1;
        let eol = OffsetDateTime::now_utc() + lifetime;
        let validity = eol
            .format(&Rfc3339)
            .map_err(|e| NameError::InvalidRecord(e.to_string()))?
            .into_bytes();

        let value = path.as_bytes().to_vec();
        let signature = self
            .keystore
            .compute_signature(key_name, &signing_bytes(&value, &validity, VALIDITY_EOL))
            .await?;

        let data_blob = serde_ipld_dagcbor::to_vec(&RecordData {
            value: value.clone(),
            validity: validity.clone(),
            validity_type: VALIDITY_EOL,
            sequence,
            ttl: lifetime.as_nanos() as u64,
        })
        .map_err(|e| NameError::InvalidRecord(e.to_string()))?;
        let mut v2_bytes = SIGNATURE_V2_PREFIX.to_vec();
        v2_bytes.extend_from_slice(&data_blob);
        let signature_v2 = self.keystore.compute_signature(key_name, &v2_bytes).await?;

        let record = NameRecord {
            value,
            signature,
            validity_type: VALIDITY_EOL,
            validity,
            sequence,
            ttl: lifetime.as_nanos() as u64,
            pub_key: key.public_key.clone(),
            signature_v2,
            data: data_blob,
        };

        self.admit(&peer, &record).await?;

        let bytes = record.encode_to_vec();
        self.routing.put(&format!("/ipns/{peer}"), &bytes).await?;
        if let Err(e) = self
            .pubsub
            .publish(&record_topic(&key.peer_id), bytes)
            .await
        {
            // Fan-out is best-effort, the DHT copy is authoritative
            warn!(peer = %peer, error = %e, "record fan-out failed");
        }

        debug!(peer = %peer, sequence, path, "published name");
        Ok(PublishedName {
            name: format!("/ipns/{peer}"),
            value: path.to_string(),
        })
    }

    /// Resolve a name to a content path.
    pub async fn resolve(
        self: &Arc<Self>,
        name: &str,
        recursive: bool,
        no_cache: bool,
    ) -> Result<String, NameError> {
        let mut current = name.to_string();
        for _ in 0..MAX_RESOLVE_DEPTH {
            let resolved = self.resolve_once(&current, no_cache).await?;
            if !recursive || resolved.starts_with("/ipfs/") {
                return Ok(resolved);
            }
            if !resolved.starts_with("/ipns/") {
                return Ok(resolved);
            }
            current = resolved;
        }
        Err(NameError::NotFound(format!(
            "{name}: resolution depth exhausted"
        )))
    }

    async fn resolve_once(self: &Arc<Self>, name: &str, no_cache: bool) -> Result<String, NameError> {
        let trimmed = name.strip_prefix("/ipns/").unwrap_or(name);
        let (head, rest) = match trimmed.split_once('/') {
            Some((head, rest)) => (head, Some(rest)),
            None => (trimmed, None),
        };
        if head.is_empty() {
            return Err(NameError::NotFound(name.to_string()));
        }

        let value = if head.contains('.') {
            match &self.dns {
                Some(dns) => dns.resolve(head).await?,
                None => return Err(NameError::DnsUnavailable),
            }
        } else {
            self.resolve_record(head, no_cache).await?
        };

        Ok(match rest {
            Some(rest) => format!("{value}/{rest}"),
            None => value,
        })
    }

    async fn resolve_record(self: &Arc<Self>, peer: &str, no_cache: bool) -> Result<String, NameError> {
        self.ensure_subscribed(peer).await;

        if !no_cache {
            if let Some(cached) = self.cache.read().await.get(peer) {
                match Self::check_validity(&cached.record) {
                    Ok(()) => return Ok(cached.value.clone()),
                    // A dead cached record is not the last word, the routing
                    // layer may hold a fresher one
                    Err(NameError::Expired(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let bytes = match self.routing.get(&format!("/ipns/{peer}")).await {
            Ok(bytes) => bytes,
            Err(RoutingError::NotFound(_)) => {
                return Err(NameError::NotFound(peer.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let record = NameRecord::decode(bytes.as_slice())
            .map_err(|e| NameError::InvalidRecord(e.to_string()))?;
        Self::check_validity(&record)?;

        match self.admit(peer, &record).await {
            Ok(()) => {}
            Err(NameError::Stale { .. }) => {
                // The routing copy is not newer than what we already hold;
                // serve the admitted record instead
                if let Some(cached) = self.cache.read().await.get(peer) {
                    return Ok(cached.value.clone());
                }
                return Err(NameError::NotFound(peer.to_string()));
            }
            Err(e) => return Err(e),
        }

        Ok(String::from_utf8_lossy(&record.value).into_owned())
    }

    /// First resolve of a name starts listening for pushed record updates,
    /// which pass through the same admission filter.
    async fn ensure_subscribed(self: &Arc<Self>, peer: &str) {
        {
            let mut subscribed = self.subscribed.lock().await;
            if !subscribed.insert(peer.to_string()) {
                return;
            }
        }
        let Ok(parsed) = peer.parse::<PeerId>() else {
            return;
        };
        let topic = record_topic(&parsed);
        let Ok(mut rx) = self.pubsub.subscribe(&topic).await else {
            warn!(peer, "record subscription failed");
            return;
        };

        let this = Arc::clone(self);
        let peer = peer.to_string();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let record = match NameRecord::decode(msg.data.as_slice()) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "undecodable pushed record");
                        continue;
                    }
                };
                if let Err(e) = this.admit(&peer, &record).await {
                    debug!(peer = %peer, error = %e, "pushed record rejected");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MemoryKeystore;
    use crate::pubsub::MemoryPubSub;
    use crate::routing::MemoryDht;

    async fn name_system(dir: &tempfile::TempDir) -> (Arc<NameSystem>, Arc<MemoryKeystore>) {
        let keystore = Arc::new(MemoryKeystore::new());
        let routing = Arc::new(Routing::new(Arc::new(MemoryDht::new(PeerId::random()))));
        let pubsub = Arc::new(MemoryPubSub::new());
        let names = NameSystem::open(
            keystore.clone(),
            routing,
            pubsub,
            None,
            dir.path().join("namesys.seq"),
        )
        .await
        .unwrap();
        (Arc::new(names), keystore)
    }

    #[tokio::test]
    async fn test_publish_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let (names, keystore) = name_system(&dir).await;
        let key = keystore.create_key("self", "ed25519").await.unwrap();

        let published = names
            .publish("/ipfs/QmTarget", "self", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(published.name, format!("/ipns/{}", key.peer_id));
        assert_eq!(published.value, "/ipfs/QmTarget");

        let resolved = names.resolve(&published.name, true, false).await.unwrap();
        assert_eq!(resolved, "/ipfs/QmTarget");
    }

    #[tokio::test]
    async fn test_sequence_increments() {
        let dir = tempfile::tempdir().unwrap();
        let (names, keystore) = name_system(&dir).await;
        let key = keystore.create_key("self", "ed25519").await.unwrap();
        let peer = key.peer_id.to_string();

        names
            .publish("/ipfs/QmA", "self", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(names.max_sequence(&peer).await, Some(1));

        names
            .publish("/ipfs/QmB", "self", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(names.max_sequence(&peer).await, Some(2));
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (names, keystore) = name_system(&dir).await;
        let key = keystore.create_key("self", "ed25519").await.unwrap();
        let peer = key.peer_id.to_string();

        names
            .publish("/ipfs/QmA", "self", Duration::from_secs(3600))
            .await
            .unwrap();

        // Keep a copy of the sequence-1 record, then move on to sequence 2
        let cached_a = {
            let cache = names.cache.read().await;
            cache.get(&peer).unwrap().record.clone()
        };
        names
            .publish("/ipfs/QmB", "self", Duration::from_secs(3600))
            .await
            .unwrap();

        // An incoming replay of the older record is rejected
        assert!(matches!(
            names.admit(&peer, &cached_a).await,
            Err(NameError::Stale { got: 1, max: 2, .. })
        ));

        // And the name still resolves to the newer value
        let resolved = names
            .resolve(&format!("/ipns/{peer}"), true, false)
            .await
            .unwrap();
        assert_eq!(resolved, "/ipfs/QmB");
    }

    #[tokio::test]
    async fn test_forged_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (names, keystore) = name_system(&dir).await;
        let key = keystore.create_key("self", "ed25519").await.unwrap();
        let peer = key.peer_id.to_string();

        names
            .publish("/ipfs/QmA", "self", Duration::from_secs(3600))
            .await
            .unwrap();
        let mut forged = {
            let cache = names.cache.read().await;
            cache.get(&peer).unwrap().record.clone()
        };
        forged.sequence = 99;
        forged.value = b"/ipfs/QmEvil".to_vec();

        assert!(matches!(
            names.admit(&peer, &forged).await,
            Err(NameError::InvalidRecord(_))
        ));
    }

    #[tokio::test]
    async fn test_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let peer;
        {
            let (names, keystore) = name_system(&dir).await;
            let key = keystore.create_key("self", "ed25519").await.unwrap();
            peer = key.peer_id.to_string();
            names
                .publish("/ipfs/QmA", "self", Duration::from_secs(3600))
                .await
                .unwrap();
            names
                .publish("/ipfs/QmB", "self", Duration::from_secs(3600))
                .await
                .unwrap();
        }

        let (names, _) = name_system(&dir).await;
        assert_eq!(names.max_sequence(&peer).await, Some(2));
    }

    #[tokio::test]
    async fn test_resolve_unknown_name() {
        let dir = tempfile::tempdir().unwrap();
        let (names, _) = name_system(&dir).await;
        let ghost = PeerId::random();
        assert!(matches!(
            names.resolve(&format!("/ipns/{ghost}"), false, false).await,
            Err(NameError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dotted_name_without_dns() {
        let dir = tempfile::tempdir().unwrap();
        let (names, _) = name_system(&dir).await;
        assert!(matches!(
            names.resolve("/ipns/docs.example.org", false, false).await,
            Err(NameError::DnsUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_dotted_name_delegates() {
        struct FixedDns;
        #[async_trait]
        impl DnsLink for FixedDns {
            async fn resolve(&self, domain: &str) -> Result<String, NameError> {
                assert_eq!(domain, "docs.example.org");
                Ok("/ipfs/QmFromDns".to_string())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let keystore = Arc::new(MemoryKeystore::new());
        let routing = Arc::new(Routing::new(Arc::new(MemoryDht::new(PeerId::random()))));
        let pubsub = Arc::new(MemoryPubSub::new());
        let names = Arc::new(
            NameSystem::open(
                keystore,
                routing,
                pubsub,
                Some(Arc::new(FixedDns)),
                dir.path().join("namesys.seq"),
            )
            .await
            .unwrap(),
        );

        let resolved = names
            .resolve("/ipns/docs.example.org/guide", false, false)
            .await
            .unwrap();
        assert_eq!(resolved, "/ipfs/QmFromDns/guide");
    }

    #[tokio::test]
    async fn test_pushed_record_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Arc::new(MemoryKeystore::new());
        let routing = Arc::new(Routing::new(Arc::new(MemoryDht::new(PeerId::random()))));
        let pubsub = Arc::new(MemoryPubSub::new());
        let names = Arc::new(
            NameSystem::open(
                keystore.clone(),
                routing,
                pubsub.clone(),
                None,
                dir.path().join("namesys.seq"),
            )
            .await
            .unwrap(),
        );
        let key = keystore.create_key("self", "ed25519").await.unwrap();
        let peer = key.peer_id.to_string();

        names
            .publish("/ipfs/QmA", "self", Duration::from_secs(3600))
            .await
            .unwrap();
        // First resolve arms the subscription
        names
            .resolve(&format!("/ipns/{peer}"), false, false)
            .await
            .unwrap();

        // A newer record pushed over the topic supersedes the cached one
        let mut newer = {
            let cache = names.cache.read().await;
            cache.get(&peer).unwrap().record.clone()
        };
        newer.sequence = 2;
        newer.value = b"/ipfs/QmPushed".to_vec();
        let signed = signing_bytes(&newer.value, &newer.validity, newer.validity_type);
        newer.signature = keystore.compute_signature("self", &signed).await.unwrap();

        pubsub
            .publish(&record_topic(&key.peer_id), newer.encode_to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let resolved = names
            .resolve(&format!("/ipns/{peer}"), false, false)
            .await
            .unwrap();
        assert_eq!(resolved, "/ipfs/QmPushed");
        assert_eq!(names.max_sequence(&peer).await, Some(2));
    }

    #[tokio::test]
    async fn test_expired_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (names, keystore) = name_system(&dir).await;
        let key = keystore.create_key("self", "ed25519").await.unwrap();
        let peer = key.peer_id.to_string();

        names
            .publish("/ipfs/QmA", "self", Duration::from_secs(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            names.resolve(&format!("/ipns/{peer}"), false, false).await,
            Err(NameError::Expired(_))
        ));
    }

    #[test]
    fn test_record_topic_shape() {
        let peer = PeerId::random();
        let topic = record_topic(&peer);
        assert!(topic.starts_with("/record/"));

        let encoded = topic.strip_prefix("/record/").unwrap();
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(encoded)
            .unwrap();
        assert!(decoded.starts_with(b"/ipns/"));
        assert_eq!(&decoded[6..], peer.to_bytes().as_slice());
    }
}
