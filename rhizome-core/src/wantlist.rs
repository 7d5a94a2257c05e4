//! Want tracking for the exchange engine
//!
//! Tracks which blocks this node is waiting for, who else wants them, and the
//! local waiters to signal on arrival. An entry exists only while it has at
//! least one waiter; the last waiter going away removes it.

use cid::Cid;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use libp2p::PeerId;
use tokio::sync::oneshot;
use tracing::trace;

use crate::store::Block;

/// Error returned to a waiter whose want was cancelled.
#[derive(Debug, thiserror::Error)]
#[error("Want cancelled for block: {0}")]
pub struct WantCancelled(pub Cid);

struct WantEntry {
    /// Local waiters keyed by their handle id.
    waiters: HashMap<u64, oneshot::Sender<Block>>,
    /// Remote peers that have asked us for this block.
    peers: HashSet<PeerId>,
    since: Instant,
}

struct WantState {
    entries: HashMap<Cid, WantEntry>,
}

/// Shared want table. Individual operations are atomic behind one short
/// critical section; nothing here suspends.
#[derive(Clone)]
pub struct WantManager {
    state: Arc<Mutex<WantState>>,
    next_id: Arc<AtomicU64>,
}

/// A registered waiter. Await `wait()` for the block; dropping the handle
/// first withdraws the waiter, and withdraws the whole entry when it was the
/// last one.
pub struct WantHandle {
    cid: Cid,
    id: u64,
    manager: WantManager,
    rx: Option<oneshot::Receiver<Block>>,
}

impl WantHandle {
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Wait for the block. Resolves with `WantCancelled` if the entry is
    /// cancelled from elsewhere before the block arrives.
    pub async fn wait(mut self) -> Result<Block, WantCancelled> {
        let rx = self.rx.take().expect("wait called once");
        rx.await.map_err(|_| WantCancelled(self.cid))
    }
}

impl Drop for WantHandle {
    fn drop(&mut self) {
        self.manager.drop_waiter(&self.cid, self.id);
    }
}

impl WantManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WantState {
                entries: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a waiter for `cid`. Returns the handle plus whether this is
    /// the first waiter, which is the broadcast trigger for the engine.
    pub fn want(&self, cid: Cid) -> (WantHandle, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock().expect("want state poisoned");
        let entry = state.entries.entry(cid).or_insert_with(|| WantEntry {
            waiters: HashMap::new(),
            peers: HashSet::new(),
            since: Instant::now(),
        });
        let first = entry.waiters.is_empty();
        entry.waiters.insert(id, tx);
        trace!(cid = %cid, waiter = id, first, "registered waiter");

        (
            WantHandle {
                cid,
                id,
                manager: self.clone(),
                rx: Some(rx),
            },
            first,
        )
    }

    fn drop_waiter(&self, cid: &Cid, id: u64) {
        let mut state = self.state.lock().expect("want state poisoned");
        if let Some(entry) = state.entries.get_mut(cid) {
            if entry.waiters.remove(&id).is_some() && entry.waiters.is_empty() {
                state.entries.remove(cid);
                trace!(cid = %cid, "last waiter gone, entry removed");
            }
        }
    }

    /// Deliver a block to every waiter and drop the entry. Each waiter is
    /// signalled exactly once; a missing entry is a no-op.
    pub fn found(&self, block: &Block) -> usize {
        let entry = {
            let mut state = self.state.lock().expect("want state poisoned");
            state.entries.remove(&block.cid)
        };
        let Some(entry) = entry else { return 0 };

        let elapsed = entry.since.elapsed();
        let count = entry.waiters.len();
        for (_, tx) in entry.waiters {
            // A dropped receiver only means the caller went away first
            let _ = tx.send(block.clone());
        }
        trace!(cid = %block.cid, waiters = count, elapsed_ms = elapsed.as_millis() as u64, "want settled");
        count
    }

    /// Cancel the entry outright: every pending waiter resolves with a
    /// cancellation error.
    pub fn unwant(&self, cid: &Cid) -> bool {
        let removed = {
            let mut state = self.state.lock().expect("want state poisoned");
            state.entries.remove(cid)
        };
        // Dropping the senders errors the receivers
        removed.is_some()
    }

    /// Record that a remote peer also wants `cid`. Only applies while the
    /// entry is alive.
    pub fn note_peer(&self, cid: &Cid, peer: PeerId) {
        let mut state = self.state.lock().expect("want state poisoned");
        if let Some(entry) = state.entries.get_mut(cid) {
            entry.peers.insert(peer);
        }
    }

    /// Drop one peer's recorded interest in `cid`.
    pub fn forget_peer(&self, cid: &Cid, peer: &PeerId) {
        let mut state = self.state.lock().expect("want state poisoned");
        if let Some(entry) = state.entries.get_mut(cid) {
            entry.peers.remove(peer);
        }
    }

    /// Drop a disconnected peer from every entry.
    pub fn forget_peer_everywhere(&self, peer: &PeerId) {
        let mut state = self.state.lock().expect("want state poisoned");
        for entry in state.entries.values_mut() {
            entry.peers.remove(peer);
        }
    }

    pub fn peers_for(&self, cid: &Cid) -> HashSet<PeerId> {
        let state = self.state.lock().expect("want state poisoned");
        state
            .entries
            .get(cid)
            .map(|e| e.peers.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        let state = self.state.lock().expect("want state poisoned");
        state.entries.contains_key(cid)
    }

    pub fn wanted(&self) -> Vec<Cid> {
        let state = self.state.lock().expect("want state poisoned");
        state.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("want state poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WantManager {
    fn default() -> Self {
        Self::new()
    }
}
