//! Keystore seam
//!
//! The real keystore (named keys, CMS envelopes) is an external collaborator;
//! this module pins down the interface the core consumes plus an in-process
//! implementation backed by ed25519 keypairs, used offline and in tests.

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use libp2p::identity::{self, ed25519};
use libp2p::PeerId;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    Exists(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedType(String),

    #[error("Envelope error: {0}")]
    Envelope(String),
}

/// Public view of a named key.
#[derive(Debug, Clone)]
pub struct KeyInfo {
    pub name: String,
    pub peer_id: PeerId,
    /// Protobuf-encoded public key, embeddable in signed records.
    pub public_key: Vec<u8>,
}

/// The slice of keystore behaviour the core depends on.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn find_key_by_name(&self, name: &str) -> Result<KeyInfo, KeyError>;

    async fn create_key(&self, name: &str, kind: &str) -> Result<KeyInfo, KeyError>;

    /// Sign `data` with the named key.
    async fn compute_signature(&self, name: &str, data: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Seal `plaintext` into an encrypted envelope under the named key.
    async fn protect(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyError>;

    /// Open an envelope produced by `protect`.
    async fn unprotect(&self, name: &str, envelope: &[u8]) -> Result<Vec<u8>, KeyError>;
}

/// In-memory keystore over ed25519 keypairs. Envelopes are
/// ChaCha20-Poly1305 with a key derived from the signing key's secret.
pub struct MemoryKeystore {
    keys: RwLock<HashMap<String, ed25519::Keypair>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Install a keypair under a name, replacing any previous holder.
    pub async fn insert(&self, name: &str, keypair: ed25519::Keypair) -> KeyInfo {
        let info = Self::info_for(name, &keypair);
        self.keys.write().await.insert(name.to_string(), keypair);
        info
    }

    fn info_for(name: &str, keypair: &ed25519::Keypair) -> KeyInfo {
        let public = identity::PublicKey::from(keypair.public());
        KeyInfo {
            name: name.to_string(),
            peer_id: public.to_peer_id(),
            public_key: public.encode_protobuf(),
        }
    }

    fn envelope_cipher(keypair: &ed25519::Keypair) -> Result<ChaCha20Poly1305, KeyError> {
        let mut hasher = Sha256::new();
        hasher.update(keypair.secret().as_ref());
        hasher.update(b"content-protection");
        let key = hasher.finalize();
        ChaCha20Poly1305::new_from_slice(&key).map_err(|e| KeyError::Envelope(e.to_string()))
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn find_key_by_name(&self, name: &str) -> Result<KeyInfo, KeyError> {
        let keys = self.keys.read().await;
        keys.get(name)
            .map(|kp| Self::info_for(name, kp))
            .ok_or_else(|| KeyError::NotFound(name.to_string()))
    }

    async fn create_key(&self, name: &str, kind: &str) -> Result<KeyInfo, KeyError> {
        if kind != "ed25519" {
            return Err(KeyError::UnsupportedType(kind.to_string()));
        }
        let mut keys = self.keys.write().await;
        if keys.contains_key(name) {
            return Err(KeyError::Exists(name.to_string()));
        }
        let keypair = ed25519::Keypair::generate();
        let info = Self::info_for(name, &keypair);
        keys.insert(name.to_string(), keypair);
        debug!(name, peer = %info.peer_id, "created key");
        Ok(info)
    }

    async fn compute_signature(&self, name: &str, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self.keys.read().await;
        let keypair = keys
            .get(name)
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        Ok(keypair.sign(data))
    }

    async fn protect(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self.keys.read().await;
        let keypair = keys
            .get(name)
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        let cipher = Self::envelope_cipher(keypair)?;
        let nonce_bytes: [u8; 12] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut out = nonce_bytes.to_vec();
        let sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| KeyError::Envelope(e.to_string()))?;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    async fn unprotect(&self, name: &str, envelope: &[u8]) -> Result<Vec<u8>, KeyError> {
        if envelope.len() < 12 {
            return Err(KeyError::Envelope("envelope too short".into()));
        }
        let keys = self.keys.read().await;
        let keypair = keys
            .get(name)
            .ok_or_else(|| KeyError::NotFound(name.to_string()))?;
        let cipher = Self::envelope_cipher(keypair)?;
        let nonce = Nonce::from_slice(&envelope[..12]);
        cipher
            .decrypt(nonce, &envelope[12..])
            .map_err(|e| KeyError::Envelope(e.to_string()))
    }
}

/// Verify a detached signature against a protobuf-encoded public key.
pub fn verify_signature(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    match identity::PublicKey::try_decode_protobuf(public_key) {
        Ok(key) => key.verify(data, signature),
        Err(_) => false,
    }
}
