//! Content addressing primitives
//!
//! CID construction and verification for the closed set of codecs and hash
//! functions the node understands. Inline (identity-hashed) CIDs carry their
//! payload inside the identifier and never touch the block store.

use cid::{Cid, Version};
use multihash::Multihash;
use multihash_codetable::{Code, MultihashDigest};
use thiserror::Error;

/// Largest block the node accepts without an explicit override.
pub const MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Payloads up to this size may be inlined into an identity CID.
pub const INLINE_LIMIT: usize = 64;

/// sha2-256 multihash code, also the leading byte of a bare v0 CID.
pub const SHA2_256_CODE: u64 = 0x12;

/// identity multihash code
pub const IDENTITY_CODE: u64 = 0x00;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Unknown codec: {0}")]
    UnknownCodec(String),

    #[error("Unknown hash algorithm: {0}")]
    UnknownHash(String),

    #[error("Hash mismatch for {cid}")]
    HashMismatch { cid: String },

    #[error("CIDv0 requires dag-pb and sha2-256")]
    InvalidV0,

    #[error("Payload of {0} bytes is too large to inline")]
    InlineTooLarge(usize),

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// The linked-data codecs this node interprets. A closed enumeration, new
/// codecs require code changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Raw,
    DagPb,
    DagCbor,
    DagJson,
    /// CMS envelope around encrypted content. No multicodec registration
    /// exists for CMS, so this sits in the private-use range.
    Cms,
}

impl Codec {
    pub fn code(&self) -> u64 {
        match self {
            Codec::Raw => 0x55,
            Codec::DagPb => 0x70,
            Codec::DagCbor => 0x71,
            Codec::DagJson => 0x0129,
            Codec::Cms => 0x30_0001,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x55 => Some(Codec::Raw),
            0x70 => Some(Codec::DagPb),
            0x71 => Some(Codec::DagCbor),
            0x0129 => Some(Codec::DagJson),
            0x30_0001 => Some(Codec::Cms),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Raw => "raw",
            Codec::DagPb => "dag-pb",
            Codec::DagCbor => "dag-cbor",
            Codec::DagJson => "dag-json",
            Codec::Cms => "cms",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, CidError> {
        match name {
            "raw" => Ok(Codec::Raw),
            "dag-pb" => Ok(Codec::DagPb),
            "dag-cbor" => Ok(Codec::DagCbor),
            "dag-json" => Ok(Codec::DagJson),
            "cms" => Ok(Codec::Cms),
            other => Err(CidError::UnknownCodec(other.to_string())),
        }
    }
}

/// Hash algorithms available for new blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hasher {
    Sha2_256,
    Sha2_512,
    Blake2b256,
    Blake2s256,
    Identity,
}

impl Hasher {
    pub fn code(&self) -> u64 {
        match self {
            Hasher::Sha2_256 => 0x12,
            Hasher::Sha2_512 => 0x13,
            Hasher::Blake2b256 => 0xb220,
            Hasher::Blake2s256 => 0xb260,
            Hasher::Identity => 0x00,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0x12 => Some(Hasher::Sha2_256),
            0x13 => Some(Hasher::Sha2_512),
            0xb220 => Some(Hasher::Blake2b256),
            0xb260 => Some(Hasher::Blake2s256),
            0x00 => Some(Hasher::Identity),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Result<Self, CidError> {
        match name {
            "sha2-256" => Ok(Hasher::Sha2_256),
            "sha2-512" => Ok(Hasher::Sha2_512),
            "blake2b-256" => Ok(Hasher::Blake2b256),
            "blake2s-256" => Ok(Hasher::Blake2s256),
            "identity" => Ok(Hasher::Identity),
            other => Err(CidError::UnknownHash(other.to_string())),
        }
    }

    /// Compute the multihash of `data` under this algorithm.
    pub fn digest(&self, data: &[u8]) -> Result<Multihash<64>, CidError> {
        let mh = match self {
            Hasher::Sha2_256 => Code::Sha2_256.digest(data),
            Hasher::Sha2_512 => Code::Sha2_512.digest(data),
            Hasher::Blake2b256 => Code::Blake2b256.digest(data),
            Hasher::Blake2s256 => Code::Blake2s256.digest(data),
            Hasher::Identity => Multihash::wrap(IDENTITY_CODE, data)
                .map_err(|e| CidError::Multihash(e.to_string()))?,
        };
        Ok(mh)
    }
}

/// Build the CID for `data` under the given codec, hash and CID version.
pub fn cid_for(data: &[u8], codec: Codec, hasher: Hasher, version: u32) -> Result<Cid, CidError> {
    let mh = hasher.digest(data)?;
    match version {
        0 => {
            if codec != Codec::DagPb || hasher != Hasher::Sha2_256 {
                return Err(CidError::InvalidV0);
            }
            Cid::new_v0(mh).map_err(|e| CidError::InvalidCid(e.to_string()))
        }
        1 => Ok(Cid::new_v1(codec.code(), mh)),
        other => Err(CidError::InvalidCid(format!("unsupported CID version {other}"))),
    }
}

/// Wrap `data` directly into an identity-hashed CID. The store never sees
/// these blocks, the identifier is the content.
pub fn inline_cid(data: &[u8], codec: Codec) -> Result<Cid, CidError> {
    if data.len() > INLINE_LIMIT {
        return Err(CidError::InlineTooLarge(data.len()));
    }
    let mh =
        Multihash::wrap(IDENTITY_CODE, data).map_err(|e| CidError::Multihash(e.to_string()))?;
    Ok(Cid::new_v1(codec.code(), mh))
}

/// Recover the embedded payload of an identity CID, or `None` for ordinary
/// hashed CIDs.
pub fn inline_data(cid: &Cid) -> Option<Vec<u8>> {
    if cid.hash().code() == IDENTITY_CODE {
        Some(cid.hash().digest().to_vec())
    } else {
        None
    }
}

/// Rehash `data` under the CID's declared algorithm and compare digests.
pub fn verify(cid: &Cid, data: &[u8]) -> Result<(), CidError> {
    let hasher = Hasher::from_code(cid.hash().code())
        .ok_or_else(|| CidError::UnknownHash(format!("0x{:x}", cid.hash().code())))?;
    let computed = hasher.digest(data)?;
    if computed.digest() != cid.hash().digest() {
        return Err(CidError::HashMismatch {
            cid: cid.to_string(),
        });
    }
    Ok(())
}

/// The self-describing prelude of a CID, without the digest itself. Sent with
/// exchanged blocks so receivers can reconstruct the full identifier from the
/// payload bytes alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub version: u64,
    pub codec: u64,
    pub mh_code: u64,
    pub mh_len: u64,
}

impl Prefix {
    pub fn from_cid(cid: &Cid) -> Self {
        Prefix {
            version: match cid.version() {
                Version::V0 => 0,
                Version::V1 => 1,
            },
            codec: cid.codec(),
            mh_code: cid.hash().code(),
            mh_len: cid.hash().size() as u64,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        let mut buf = unsigned_varint::encode::u64_buffer();
        for field in [self.version, self.codec, self.mh_code, self.mh_len] {
            out.extend_from_slice(unsigned_varint::encode::u64(field, &mut buf));
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let (version, rest) = unsigned_varint::decode::u64(bytes)
            .map_err(|e| CidError::InvalidCid(e.to_string()))?;
        let (codec, rest) = unsigned_varint::decode::u64(rest)
            .map_err(|e| CidError::InvalidCid(e.to_string()))?;
        let (mh_code, rest) = unsigned_varint::decode::u64(rest)
            .map_err(|e| CidError::InvalidCid(e.to_string()))?;
        let (mh_len, _) = unsigned_varint::decode::u64(rest)
            .map_err(|e| CidError::InvalidCid(e.to_string()))?;
        Ok(Prefix {
            version,
            codec,
            mh_code,
            mh_len,
        })
    }

    /// Hash `data` under the prefix's algorithm and assemble the full CID.
    pub fn cid_of(&self, data: &[u8]) -> Result<Cid, CidError> {
        let hasher = Hasher::from_code(self.mh_code)
            .ok_or_else(|| CidError::UnknownHash(format!("0x{:x}", self.mh_code)))?;
        let mh = hasher.digest(data)?;
        match self.version {
            0 => Cid::new_v0(mh).map_err(|e| CidError::InvalidCid(e.to_string())),
            1 => Ok(Cid::new_v1(self.codec, mh)),
            other => Err(CidError::InvalidCid(format!(
                "unsupported CID version {other}"
            ))),
        }
    }
}

/// Parse a CID from the front of `bytes`, returning it together with the
/// number of bytes consumed. A leading `0x12 0x20` is a bare sha2-256
/// multihash, read as a v0 CID.
pub fn read_cid(bytes: &[u8]) -> Result<(Cid, usize), CidError> {
    if bytes.len() >= 2 && bytes[0] == 0x12 && bytes[1] == 0x20 {
        if bytes.len() < 34 {
            return Err(CidError::InvalidCid("truncated v0 CID".into()));
        }
        let mh = Multihash::from_bytes(&bytes[..34])
            .map_err(|e| CidError::Multihash(e.to_string()))?;
        let cid = Cid::new_v0(mh).map_err(|e| CidError::InvalidCid(e.to_string()))?;
        return Ok((cid, 34));
    }

    let (version, rest) =
        unsigned_varint::decode::u64(bytes).map_err(|e| CidError::InvalidCid(e.to_string()))?;
    if version != 1 {
        return Err(CidError::InvalidCid(format!(
            "unsupported CID version {version}"
        )));
    }
    let (codec, rest) =
        unsigned_varint::decode::u64(rest).map_err(|e| CidError::InvalidCid(e.to_string()))?;
    let (mh_code, rest) =
        unsigned_varint::decode::u64(rest).map_err(|e| CidError::InvalidCid(e.to_string()))?;
    let (mh_len, rest) =
        unsigned_varint::decode::u64(rest).map_err(|e| CidError::InvalidCid(e.to_string()))?;
    if rest.len() < mh_len as usize {
        return Err(CidError::InvalidCid("truncated multihash".into()));
    }
    let mh = Multihash::wrap(mh_code, &rest[..mh_len as usize])
        .map_err(|e| CidError::Multihash(e.to_string()))?;
    let cid = Cid::new_v1(codec, mh);
    let consumed = bytes.len() - rest.len() + mh_len as usize;
    Ok((cid, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_for_v1_raw() {
        let cid = cid_for(b"hello world", Codec::Raw, Hasher::Sha2_256, 1).unwrap();
        assert_eq!(cid.version(), Version::V1);
        assert_eq!(cid.codec(), 0x55);
        assert_eq!(cid.hash().code(), SHA2_256_CODE);

        // Same input, same CID
        let cid2 = cid_for(b"hello world", Codec::Raw, Hasher::Sha2_256, 1).unwrap();
        assert_eq!(cid, cid2);
    }

    #[test]
    fn test_cid_v0_only_dag_pb_sha256() {
        assert!(cid_for(b"x", Codec::DagPb, Hasher::Sha2_256, 0).is_ok());
        assert!(matches!(
            cid_for(b"x", Codec::Raw, Hasher::Sha2_256, 0),
            Err(CidError::InvalidV0)
        ));
        assert!(matches!(
            cid_for(b"x", Codec::DagPb, Hasher::Blake2b256, 0),
            Err(CidError::InvalidV0)
        ));
    }

    #[test]
    fn test_inline_roundtrip() {
        let cid = inline_cid(b"blorb", Codec::Raw).unwrap();
        assert_eq!(cid.hash().code(), IDENTITY_CODE);
        assert_eq!(inline_data(&cid).unwrap(), b"blorb");
        // The exact base32 form is pinned down by the identity multihash
        assert_eq!(cid.to_string(), "bafkqablcnrxxeyq");
    }

    #[test]
    fn test_inline_limit() {
        let just_fits = vec![0u8; INLINE_LIMIT];
        assert!(inline_cid(&just_fits, Codec::Raw).is_ok());

        let too_big = vec![0u8; INLINE_LIMIT + 1];
        assert!(matches!(
            inline_cid(&too_big, Codec::Raw),
            Err(CidError::InlineTooLarge(_))
        ));
    }

    #[test]
    fn test_inline_data_none_for_hashed() {
        let cid = cid_for(b"hello", Codec::Raw, Hasher::Sha2_256, 1).unwrap();
        assert!(inline_data(&cid).is_none());
    }

    #[test]
    fn test_verify() {
        let cid = cid_for(b"hello world", Codec::Raw, Hasher::Sha2_256, 1).unwrap();
        assert!(verify(&cid, b"hello world").is_ok());
        assert!(matches!(
            verify(&cid, b"goodbye world"),
            Err(CidError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_verify_blake2() {
        let cid = cid_for(b"hello world", Codec::Raw, Hasher::Blake2b256, 1).unwrap();
        assert!(verify(&cid, b"hello world").is_ok());
        assert_eq!(
            cid.to_string(),
            "bafk2bzaceaswza5ss4iu2ia3galz6pyo6dfm5f4dmiw2lf2de22dmf4k533ba"
        );
    }

    #[test]
    fn test_prefix_roundtrip() {
        let cid = cid_for(b"hello", Codec::DagPb, Hasher::Sha2_256, 1).unwrap();
        let prefix = Prefix::from_cid(&cid);
        let bytes = prefix.to_bytes();
        let parsed = Prefix::from_bytes(&bytes).unwrap();
        assert_eq!(prefix, parsed);

        // A prefix plus the payload reconstructs the identical CID
        let rebuilt = parsed.cid_of(b"hello").unwrap();
        assert_eq!(rebuilt, cid);
    }

    #[test]
    fn test_prefix_v0() {
        let cid = cid_for(b"hello", Codec::DagPb, Hasher::Sha2_256, 0).unwrap();
        let prefix = Prefix::from_cid(&cid);
        assert_eq!(prefix.version, 0);
        let rebuilt = prefix.cid_of(b"hello").unwrap();
        assert_eq!(rebuilt, cid);
    }

    #[test]
    fn test_prefix_unknown_hash() {
        let prefix = Prefix {
            version: 1,
            codec: 0x55,
            mh_code: 0xdead,
            mh_len: 32,
        };
        assert!(matches!(
            prefix.cid_of(b"x"),
            Err(CidError::UnknownHash(_))
        ));
    }

    #[test]
    fn test_read_cid_v1() {
        let cid = cid_for(b"hello", Codec::Raw, Hasher::Sha2_256, 1).unwrap();
        let mut bytes = cid.to_bytes();
        bytes.extend_from_slice(b"trailing data");
        let (parsed, consumed) = read_cid(&bytes).unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(consumed, cid.to_bytes().len());
    }

    #[test]
    fn test_read_cid_v0() {
        let cid = cid_for(b"hello", Codec::DagPb, Hasher::Sha2_256, 0).unwrap();
        let mut bytes = cid.to_bytes();
        bytes.extend_from_slice(&[1, 2, 3]);
        let (parsed, consumed) = read_cid(&bytes).unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(consumed, 34);
    }

    #[test]
    fn test_codec_names() {
        for codec in [Codec::Raw, Codec::DagPb, Codec::DagCbor, Codec::DagJson, Codec::Cms] {
            assert_eq!(Codec::from_name(codec.name()).unwrap(), codec);
            assert_eq!(Codec::from_code(codec.code()).unwrap(), codec);
        }
        assert!(Codec::from_name("bencode").is_err());
    }

    #[test]
    fn test_hasher_names() {
        for hasher in [
            Hasher::Sha2_256,
            Hasher::Sha2_512,
            Hasher::Blake2b256,
            Hasher::Blake2s256,
            Hasher::Identity,
        ] {
            assert_eq!(Hasher::from_code(hasher.code()).unwrap(), hasher);
        }
        assert_eq!(Hasher::from_name("blake2b-256").unwrap(), Hasher::Blake2b256);
        assert!(Hasher::from_name("md5").is_err());
    }
}
