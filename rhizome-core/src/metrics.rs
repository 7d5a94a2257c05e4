//! Node metrics
//!
//! Thread-safe counters using atomic types, cloned freely across tasks.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    peer_connections: AtomicUsize,

    blocks_sent: AtomicU64,
    blocks_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    /// Received blocks that were already in the store.
    duplicate_blocks: AtomicU64,
    /// Received blocks nothing was waiting for.
    unsolicited_blocks: AtomicU64,

    wants_broadcast: AtomicU64,

    start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                peer_connections: AtomicUsize::new(0),
                blocks_sent: AtomicU64::new(0),
                blocks_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                duplicate_blocks: AtomicU64::new(0),
                unsolicited_blocks: AtomicU64::new(0),
                wants_broadcast: AtomicU64::new(0),
                start_time: SystemTime::now(),
            }),
        }
    }

    pub fn peer_connected(&self) {
        self.inner.peer_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peer_disconnected(&self) {
        let _ = self.inner.peer_connections.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |v| v.checked_sub(1),
        );
    }

    pub fn block_sent(&self, bytes: usize) {
        self.inner.blocks_sent.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn block_received(&self, bytes: usize) {
        self.inner.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn duplicate_block(&self) {
        self.inner.duplicate_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unsolicited_block(&self) {
        self.inner.unsolicited_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn want_broadcast(&self) {
        self.inner.wants_broadcast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime_secs = SystemTime::now()
            .duration_since(self.inner.start_time)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let epoch_start = self
            .inner
            .start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        MetricsSnapshot {
            peer_connections: self.inner.peer_connections.load(Ordering::Relaxed),
            blocks_sent: self.inner.blocks_sent.load(Ordering::Relaxed),
            blocks_received: self.inner.blocks_received.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.inner.bytes_received.load(Ordering::Relaxed),
            duplicate_blocks: self.inner.duplicate_blocks.load(Ordering::Relaxed),
            unsolicited_blocks: self.inner.unsolicited_blocks.load(Ordering::Relaxed),
            wants_broadcast: self.inner.wants_broadcast.load(Ordering::Relaxed),
            started_at: epoch_start,
            uptime_secs,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub peer_connections: usize,
    pub blocks_sent: u64,
    pub blocks_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub duplicate_blocks: u64,
    pub unsolicited_blocks: u64,
    pub wants_broadcast: u64,
    pub started_at: u64,
    pub uptime_secs: u64,
}
