//! Fixed-size stream chunking
//!
//! Splits an incoming byte stream into the leaf-sized pieces the DAG builder
//! links together. The chunker is driven by a [`ChunkerSpec`], the same token
//! callers pass on the import surface, and keeps running totals so builders
//! can report progress.

use std::io;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default chunk size: 256 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 262_144;

/// Chunking strategy, parsed from tokens like `size-262144`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkerSpec {
    Size(usize),
}

impl ChunkerSpec {
    pub fn chunk_size(&self) -> usize {
        match self {
            ChunkerSpec::Size(n) => *n,
        }
    }
}

impl Default for ChunkerSpec {
    fn default() -> Self {
        ChunkerSpec::Size(DEFAULT_CHUNK_SIZE)
    }
}

impl FromStr for ChunkerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(size) = s.strip_prefix("size-") {
            let n: usize = size
                .parse()
                .map_err(|_| format!("invalid chunk size in {s:?}"))?;
            if n == 0 {
                return Err("chunk size must be greater than 0".into());
            }
            return Ok(ChunkerSpec::Size(n));
        }
        Err(format!("unknown chunker {s:?}"))
    }
}

impl std::fmt::Display for ChunkerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkerSpec::Size(n) => write!(f, "size-{n}"),
        }
    }
}

/// Cuts a reader into leaves according to a [`ChunkerSpec`]. The final chunk
/// may be short; an empty stream yields no chunk at all.
pub struct Chunker<R> {
    reader: R,
    spec: ChunkerSpec,
    chunks_emitted: u64,
    bytes_read: u64,
    eof_reached: bool,
}

impl<R: AsyncRead + Unpin> Chunker<R> {
    pub fn new(reader: R, spec: ChunkerSpec) -> Self {
        assert!(spec.chunk_size() > 0, "chunk size must be greater than 0");
        Self {
            reader,
            spec,
            chunks_emitted: 0,
            bytes_read: 0,
            eof_reached: false,
        }
    }

    /// Read the next chunk, or `None` at end of stream. Each returned chunk
    /// is exactly `spec.chunk_size()` bytes except possibly the last.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.eof_reached {
            return Ok(None);
        }

        let target = self.spec.chunk_size();
        let mut chunk = Vec::with_capacity(target);
        while chunk.len() < target {
            if self.reader.read_buf(&mut chunk).await? == 0 {
                self.eof_reached = true;
                break;
            }
        }

        if chunk.is_empty() {
            return Ok(None);
        }
        self.chunks_emitted += 1;
        self.bytes_read += chunk.len() as u64;
        Ok(Some(chunk))
    }
}

impl<R> Chunker<R> {
    pub fn spec(&self) -> ChunkerSpec {
        self.spec
    }

    /// Leaves produced so far.
    pub fn chunks_emitted(&self) -> u64 {
        self.chunks_emitted
    }

    /// Payload bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn is_eof(&self) -> bool {
        self.eof_reached
    }
}
