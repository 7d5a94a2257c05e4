//! dag-pb and UnixFS node codec
//!
//! prost messages handle decoding; encoding is done by hand because the
//! canonical dag-pb byte form puts the links (field 2) ahead of the data
//! (field 1), which no generic protobuf encoder produces. Root CIDs are only
//! reproducible when every implementation agrees on these bytes.

use cid::Cid;
use prost::Message as ProstMessage;
use thiserror::Error;

use crate::content_id::Codec;

/// UnixFS node types carried in the dag-pb data field.
pub const TYPE_RAW: i32 = 0;
pub const TYPE_DIRECTORY: i32 = 1;
pub const TYPE_FILE: i32 = 2;

#[derive(Debug, Error)]
pub enum UnixFsError {
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid dag-pb link: {0}")]
    InvalidLink(String),

    #[error("Not a UnixFS node")]
    NotUnixFs,
}

/// A link out of a dag-pb node: child CID, name and the cumulative encoded
/// size of the child subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagLink {
    pub cid: Cid,
    pub name: String,
    pub tsize: u64,
}

/// Decoded shape of a dag-pb node.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PbNode {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,

    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbLink {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: Option<Vec<u8>>,

    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,

    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

/// UnixFS metadata held in a dag-pb node's data field.
#[derive(Clone, PartialEq, prost::Message)]
pub struct UnixFsData {
    #[prost(int32, tag = "1")]
    pub node_type: i32,

    #[prost(bytes = "vec", optional, tag = "2")]
    pub data: Option<Vec<u8>>,

    #[prost(uint64, optional, tag = "3")]
    pub filesize: Option<u64>,

    #[prost(uint64, repeated, packed = "false", tag = "4")]
    pub blocksizes: Vec<u64>,

    #[prost(uint64, optional, tag = "5")]
    pub hash_type: Option<u64>,

    #[prost(uint64, optional, tag = "6")]
    pub fanout: Option<u64>,
}

fn push_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(value, &mut buf));
}

fn encode_link(link: &DagLink) -> Vec<u8> {
    let hash = link.cid.to_bytes();
    let mut out = Vec::with_capacity(hash.len() + link.name.len() + 12);
    // Hash (1), Name (2) and Tsize (3) in field order; the name is written
    // even when empty, matching the canonical form for file chunks.
    out.push(0x0a);
    push_varint(&mut out, hash.len() as u64);
    out.extend_from_slice(&hash);
    out.push(0x12);
    push_varint(&mut out, link.name.len() as u64);
    out.extend_from_slice(link.name.as_bytes());
    out.push(0x18);
    push_varint(&mut out, link.tsize);
    out
}

/// Canonical dag-pb encoding: every link (field 2) first, then the data
/// field (1).
pub fn encode_node(data: Option<&[u8]>, links: &[DagLink]) -> Vec<u8> {
    let mut out = Vec::new();
    for link in links {
        let body = encode_link(link);
        out.push(0x12);
        push_varint(&mut out, body.len() as u64);
        out.extend_from_slice(&body);
    }
    if let Some(data) = data {
        out.push(0x0a);
        push_varint(&mut out, data.len() as u64);
        out.extend_from_slice(data);
    }
    out
}

/// Decode a dag-pb node into its UnixFS metadata (when present) and links.
pub fn decode_node(bytes: &[u8]) -> Result<(Option<UnixFsData>, Vec<DagLink>), UnixFsError> {
    let node = PbNode::decode(bytes)?;
    let mut links = Vec::with_capacity(node.links.len());
    for link in node.links {
        let hash = link
            .hash
            .ok_or_else(|| UnixFsError::InvalidLink("missing hash".into()))?;
        let cid = Cid::try_from(hash.as_slice())
            .map_err(|e| UnixFsError::InvalidLink(e.to_string()))?;
        links.push(DagLink {
            cid,
            name: link.name.unwrap_or_default(),
            tsize: link.tsize.unwrap_or(0),
        });
    }
    let meta = match node.data {
        Some(data) if !data.is_empty() => Some(UnixFsData::decode(data.as_slice())?),
        _ => None,
    };
    Ok((meta, links))
}

/// Outgoing links of a block, for DAG traversal. Only dag-pb links are
/// interpreted; every other codec is a leaf.
pub fn links_of(codec: u64, bytes: &[u8]) -> Result<Vec<DagLink>, UnixFsError> {
    if Codec::from_code(codec) != Some(Codec::DagPb) {
        return Ok(Vec::new());
    }
    Ok(decode_node(bytes)?.1)
}

/// Encode a UnixFS file leaf holding `data` inline. An empty payload still
/// produces a well-formed file node with a zero filesize.
pub fn file_leaf(data: &[u8]) -> Vec<u8> {
    let meta = UnixFsData {
        node_type: TYPE_FILE,
        data: if data.is_empty() {
            None
        } else {
            Some(data.to_vec())
        },
        filesize: Some(data.len() as u64),
        blocksizes: Vec::new(),
        hash_type: None,
        fanout: None,
    };
    encode_node(Some(&meta.encode_to_vec()), &[])
}

/// Encode an inner file node bundling `links`. `blocksizes` carries each
/// child's declared file size, in link order.
pub fn file_stem(links: &[DagLink], blocksizes: &[u64]) -> Vec<u8> {
    let meta = UnixFsData {
        node_type: TYPE_FILE,
        data: None,
        filesize: Some(blocksizes.iter().sum()),
        blocksizes: blocksizes.to_vec(),
        hash_type: None,
        fanout: None,
    };
    encode_node(Some(&meta.encode_to_vec()), links)
}

/// Encode a directory node. Entries are sorted by name so directory builds
/// are order-independent.
pub fn directory(entries: &[DagLink]) -> Vec<u8> {
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let meta = UnixFsData {
        node_type: TYPE_DIRECTORY,
        data: None,
        filesize: None,
        blocksizes: Vec::new(),
        hash_type: None,
        fanout: None,
    };
    encode_node(Some(&meta.encode_to_vec()), &sorted)
}

/// The declared file size of a UnixFS file node, if it is one.
pub fn file_size(bytes: &[u8]) -> Result<Option<u64>, UnixFsError> {
    let (meta, _) = decode_node(bytes)?;
    Ok(meta.and_then(|m| {
        if m.node_type == TYPE_FILE {
            m.filesize
        } else {
            None
        }
    }))
}
