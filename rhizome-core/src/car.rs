//! Content-addressed archive codec
//!
//! Streaming container of `(cid, bytes)` entries behind a dag-cbor header
//! naming the roots. Every frame is varint-length-prefixed. Version 1 is
//! written; version 2 input is accepted by skipping the fixed 40-byte frame
//! in front of the inner v1 archive.

use cid::Cid;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::blocks::{BlockError, BlockService};
use crate::content_id::{self, CidError};
use crate::unixfs::{self, UnixFsError};

/// Size of the fixed header frame a v2 archive wraps around its inner v1.
const V2_HEADER_SIZE: usize = 40;

/// Ceiling for one archive frame.
const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid archive header: {0}")]
    Header(String),

    #[error("Unsupported archive version {0}")]
    UnsupportedVersion(u64),

    #[error("Truncated archive")]
    Truncated,

    #[error("Frame of {0} bytes exceeds the archive frame limit")]
    FrameTooLarge(u64),

    #[error(transparent)]
    Cid(#[from] CidError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    UnixFs(#[from] UnixFsError),
}

#[derive(Debug, Serialize, Deserialize)]
struct CarHeader {
    #[serde(skip_serializing_if = "Option::is_none")]
    roots: Option<Vec<Cid>>,
    version: u64,
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<u64>, CarError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Clean end of stream only between frames
                if first {
                    return Ok(None);
                }
                return Err(CarError::Truncated);
            }
            Err(e) => return Err(e.into()),
        }
        first = false;
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            return Err(CarError::Header("varint overflow".into()));
        }
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, CarError> {
    let Some(len) = read_varint(reader).await? else {
        return Ok(None);
    };
    if len > MAX_FRAME_SIZE {
        return Err(CarError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|_| CarError::Truncated)?;
    Ok(Some(buf))
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = unsigned_varint::encode::u64_buffer();
    out.extend_from_slice(unsigned_varint::encode::u64(value, &mut buf));
}

/// Streaming archive writer.
pub struct CarWriter<W> {
    writer: W,
    wrote_header: bool,
}

impl<W: AsyncWrite + Unpin> CarWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            wrote_header: false,
        }
    }

    pub async fn write_header(&mut self, roots: &[Cid]) -> Result<(), CarError> {
        let header = CarHeader {
            roots: Some(roots.to_vec()),
            version: 1,
        };
        let body =
            serde_ipld_dagcbor::to_vec(&header).map_err(|e| CarError::Header(e.to_string()))?;
        let mut frame = Vec::with_capacity(body.len() + 4);
        write_varint(&mut frame, body.len() as u64);
        frame.extend_from_slice(&body);
        self.writer.write_all(&frame).await?;
        self.wrote_header = true;
        Ok(())
    }

    pub async fn write_block(&mut self, cid: &Cid, data: &[u8]) -> Result<(), CarError> {
        debug_assert!(self.wrote_header, "header must precede blocks");
        let cid_bytes = cid.to_bytes();
        let mut frame = Vec::with_capacity(cid_bytes.len() + data.len() + 4);
        write_varint(&mut frame, (cid_bytes.len() + data.len()) as u64);
        frame.extend_from_slice(&cid_bytes);
        frame.extend_from_slice(data);
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<W, CarError> {
        self.writer.flush().await?;
        Ok(self.writer)
    }
}

/// Streaming archive reader.
pub struct CarReader<R> {
    reader: R,
    roots: Vec<Cid>,
}

impl<R: AsyncRead + Unpin> CarReader<R> {
    /// Parse the header, unwrapping a v2 frame down to the inner v1 archive.
    pub async fn new(mut reader: R) -> Result<Self, CarError> {
        let header = Self::read_header(&mut reader).await?;
        let header = match header.version {
            1 => header,
            2 => {
                let mut skip = [0u8; V2_HEADER_SIZE];
                reader
                    .read_exact(&mut skip)
                    .await
                    .map_err(|_| CarError::Truncated)?;
                let inner = Self::read_header(&mut reader).await?;
                if inner.version != 1 {
                    return Err(CarError::UnsupportedVersion(inner.version));
                }
                inner
            }
            other => return Err(CarError::UnsupportedVersion(other)),
        };
        Ok(Self {
            reader,
            roots: header.roots.unwrap_or_default(),
        })
    }

    async fn read_header(reader: &mut R) -> Result<CarHeader, CarError> {
        let frame = read_frame(reader).await?.ok_or(CarError::Truncated)?;
        serde_ipld_dagcbor::from_slice(&frame).map_err(|e| CarError::Header(e.to_string()))
    }

    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Next `(cid, bytes)` entry, or `None` at a clean end of stream.
    pub async fn next_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, CarError> {
        let Some(frame) = read_frame(&mut self.reader).await? else {
            return Ok(None);
        };
        let (cid, consumed) = content_id::read_cid(&frame)?;
        Ok(Some((cid, frame[consumed..].to_vec())))
    }
}

/// Export the DAG under `root` breadth-first, each reachable block exactly
/// once. Unreachable blocks never appear.
pub async fn export<W: AsyncWrite + Unpin>(
    blocks: &BlockService,
    root: &Cid,
    writer: W,
) -> Result<W, CarError> {
    let mut car = CarWriter::new(writer);
    car.write_header(std::slice::from_ref(root)).await?;

    let mut queue = VecDeque::from([*root]);
    let mut seen = HashSet::new();
    let mut exported = 0usize;
    while let Some(cid) = queue.pop_front() {
        if !seen.insert(cid) {
            continue;
        }
        let data = blocks.get(&cid).await?;
        car.write_block(&cid, &data).await?;
        exported += 1;
        for link in unixfs::links_of(cid.codec(), &data)? {
            queue.push_back(link.cid);
        }
    }
    debug!(root = %root, blocks = exported, "exported archive");
    car.finish().await
}

/// Import every entry through the block layer, optionally pinning the
/// declared roots. Returns the roots in header order.
pub async fn import<R: AsyncRead + Unpin>(
    blocks: &BlockService,
    reader: R,
    pin_roots: bool,
) -> Result<Vec<Cid>, CarError> {
    let mut car = CarReader::new(reader).await?;
    let roots = car.roots().to_vec();

    let mut imported = 0usize;
    while let Some((cid, data)) = car.next_block().await? {
        blocks.put_verified(&cid, &data).await?;
        imported += 1;
    }
    debug!(blocks = imported, roots = roots.len(), "imported archive");

    if pin_roots {
        for root in &roots {
            blocks.pin_add(root, true).await?;
        }
    }
    Ok(roots)
}
