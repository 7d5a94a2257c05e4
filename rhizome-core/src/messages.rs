//! Block exchange protobuf messages
//!
//! Hand-derived prost messages for the wire format spoken on
//! `/ipfs/bitswap/1.0.0` through `/ipfs/bitswap/1.2.0`. Messages travel
//! varint-length-prefixed on the stream.

use prost::Message as ProstMessage;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(message, optional, tag = "1")]
    pub wantlist: Option<Wantlist>,

    /// Bare block bytes, only used on 1.0.0 streams.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub blocks: Vec<Vec<u8>>,

    /// Prefixed blocks, used from 1.1.0 on.
    #[prost(message, repeated, tag = "3")]
    pub payload: Vec<BlockMsg>,

    #[prost(message, repeated, tag = "4")]
    pub block_presences: Vec<BlockPresence>,

    #[prost(int32, tag = "5")]
    pub pending_bytes: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Wantlist {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<WantlistEntry>,

    #[prost(bool, tag = "2")]
    pub full: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WantlistEntry {
    /// CID bytes of the wanted block.
    #[prost(bytes = "vec", tag = "1")]
    pub block: Vec<u8>,

    #[prost(int32, tag = "2")]
    pub priority: i32,

    #[prost(bool, tag = "3")]
    pub cancel: bool,

    #[prost(enumeration = "WantType", tag = "4")]
    pub want_type: i32,

    #[prost(bool, tag = "5")]
    pub send_dont_have: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WantType {
    WantBlock = 0,
    WantHave = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockMsg {
    /// CID version, codec, hash code and digest length as varints.
    #[prost(bytes = "vec", tag = "1")]
    pub prefix: Vec<u8>,

    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockPresence {
    #[prost(bytes = "vec", tag = "1")]
    pub cid: Vec<u8>,

    #[prost(enumeration = "BlockPresenceType", tag = "2")]
    pub r#type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

/// Encode an exchange message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, prost::EncodeError> {
    let mut buf = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut buf)?;
    Ok(buf)
}

/// Decode an exchange message from bytes.
pub fn decode_message(bytes: &[u8]) -> Result<Message, prost::DecodeError> {
    Message::decode(bytes)
}

impl Message {
    pub fn is_empty(&self) -> bool {
        self.wantlist.is_none()
            && self.blocks.is_empty()
            && self.payload.is_empty()
            && self.block_presences.is_empty()
    }

    /// Rewrite the message so it only carries features the negotiated
    /// protocol understands. 1.1.0 predates presences and want-have; 1.0.0
    /// additionally expects bare block bytes instead of prefixed payloads.
    pub fn downgrade_for(&self, version: crate::exchange::ProtocolVersion) -> Message {
        use crate::exchange::ProtocolVersion;

        let mut msg = self.clone();
        match version {
            ProtocolVersion::V120 => msg,
            ProtocolVersion::V110 => {
                msg.block_presences.clear();
                if let Some(wl) = msg.wantlist.as_mut() {
                    for entry in wl.entries.iter_mut() {
                        entry.want_type = WantType::WantBlock as i32;
                        entry.send_dont_have = false;
                    }
                }
                msg
            }
            ProtocolVersion::V100 => {
                msg.block_presences.clear();
                if let Some(wl) = msg.wantlist.as_mut() {
                    for entry in wl.entries.iter_mut() {
                        entry.want_type = WantType::WantBlock as i32;
                        entry.send_dont_have = false;
                    }
                }
                msg.blocks = msg.payload.drain(..).map(|b| b.data).collect();
                msg
            }
        }
    }
}
