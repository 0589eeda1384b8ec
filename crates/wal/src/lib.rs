//! # WAL — Write Log
//!
//! Writes enter the disk as entries in this in-memory FIFO and are later
//! drained into shards by the flush path. Reads replay the log on top of
//! whatever the shards returned, so the log always dominates shard state.
//!
//! ## Concurrency contract
//!
//! - `append` may be called from any number of threads.
//! - `iterate` returns a cursor that never skips or duplicates entries and
//!   sees every entry appended before any later `next` call.
//! - `oldest`/`remove_oldest` belong to the single drainer (the thread
//!   holding the engine's maintenance mutex).
//!
//! The log is a singly-linked list of reference-counted nodes behind a
//! permanent sentinel. `next` pointers are write-once, so a cursor walks
//! the chain without locking; only the head/tail bookkeeping takes the
//! mutex. A cursor that outlives `remove_oldest` keeps the removed nodes
//! alive and may still traverse them — replaying an already-drained entry
//! is harmless because the drain wrote the same data to the shards.

use hashspace::Coordinate;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::OnceLock;

/// One pending write: a put carries a point coordinate, value, and version;
/// a delete carries a key-only (tombstone) coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub coord: Coordinate,
    pub key: Vec<u8>,
    pub value: Vec<Vec<u8>>,
    pub version: u64,
}

impl LogEntry {
    pub fn put(coord: Coordinate, key: Vec<u8>, value: Vec<Vec<u8>>, version: u64) -> Self {
        debug_assert!(coord.is_point());
        Self {
            coord,
            key,
            value,
            version,
        }
    }

    pub fn tombstone(coord: Coordinate, key: Vec<u8>) -> Self {
        debug_assert_eq!(coord.secondary_mask, 0);
        Self {
            coord,
            key,
            value: Vec::new(),
            version: 0,
        }
    }

    /// Deletes are distinguished by their unconstrained secondary axis.
    pub fn is_tombstone(&self) -> bool {
        self.coord.secondary_mask == 0
    }
}

struct Node {
    /// `None` only for the sentinel.
    entry: Option<Arc<LogEntry>>,
    next: OnceLock<Arc<Node>>,
}

impl Node {
    fn sentinel() -> Arc<Node> {
        Arc::new(Node {
            entry: None,
            next: OnceLock::new(),
        })
    }
}

struct Chain {
    /// The node *before* the oldest pending entry.
    head: Arc<Node>,
    /// The newest node; `tail.next` is always unset.
    tail: Arc<Node>,
}

/// Concurrent append-only FIFO of pending writes.
pub struct WriteLog {
    chain: Mutex<Chain>,
}

impl WriteLog {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self {
            chain: Mutex::new(Chain {
                head: sentinel.clone(),
                tail: sentinel,
            }),
        }
    }

    /// Appends an entry at the tail.
    pub fn append(&self, entry: LogEntry) {
        let node = Arc::new(Node {
            entry: Some(Arc::new(entry)),
            next: OnceLock::new(),
        });
        let mut chain = self.chain.lock();
        chain
            .tail
            .next
            .set(node.clone())
            .unwrap_or_else(|_| unreachable!("tail node already linked"));
        chain.tail = node;
    }

    /// A cursor positioned before the oldest pending entry. It observes
    /// every entry appended before each of its `next` calls.
    pub fn iterate(&self) -> LogCursor {
        LogCursor {
            at: self.chain.lock().head.clone(),
        }
    }

    /// The oldest pending entry, if any. Drainer only.
    pub fn oldest(&self) -> Option<Arc<LogEntry>> {
        let chain = self.chain.lock();
        chain
            .head
            .next
            .get()
            .map(|n| n.entry.clone().unwrap_or_else(|| unreachable!()))
    }

    /// Discards the oldest pending entry. Drainer only.
    pub fn remove_oldest(&self) {
        let mut chain = self.chain.lock();
        if let Some(next) = chain.head.next.get().cloned() {
            chain.head = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chain.lock().head.next.get().is_none()
    }
}

impl Default for WriteLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable forward cursor over a [`WriteLog`].
pub struct LogCursor {
    at: Arc<Node>,
}

impl Iterator for LogCursor {
    type Item = Arc<LogEntry>;

    fn next(&mut self) -> Option<Arc<LogEntry>> {
        let next = self.at.next.get()?.clone();
        self.at = next;
        Some(
            self.at
                .entry
                .clone()
                .unwrap_or_else(|| unreachable!("only the sentinel lacks an entry")),
        )
    }
}
