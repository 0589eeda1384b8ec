//! # Engine — Quadrant Disk Core
//!
//! The central orchestrator that ties together the [`hashspace`], [`shard`],
//! and [`wal`] crates into the on-disk half of a two-dimensionally hashed
//! key-value store.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌─────────────────────────────────────────────────┐
//! │                     DISK                        │
//! │                                                 │
//! │ write.rs → put/del → WriteLog append            │
//! │              |                                  │
//! │              |  flush() drains ≤100 entries     │
//! │              v                                  │
//! │        ShardVector (immutable, swapped          │
//! │        copy-on-write under shards lock)         │
//! │              |                                  │
//! │              |  full shard?                     │
//! │              v                                  │
//! │   maintenance.rs → clean (compact in place)     │
//! │                  → split (1 shard -> 4)         │
//! │                  → preallocate spare files      │
//! │                                                 │
//! │ read.rs → every covering shard, then replay     │
//! │           the write log on top (log wins)       │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                            |
//! |-----------------|----------------------------------------------------|
//! | [`lib.rs`]      | `Disk` struct, open, sync, accessors, `Debug`      |
//! | [`vector`]      | Immutable `(coordinate, shard)` list, 1→1 and 1→4 replace |
//! | [`read`]        | `get()` — shard scan cross-checked against the log |
//! | [`write`]       | `put()`, `del()`, the `flush()` drain loop         |
//! | [`maintenance`] | full-shard handling: clean, split, spare pool, destroy |
//! | [`recovery`]    | shard filenames, directory cleanup and reload      |
//!
//! ## Locking
//!
//! At any given time only one thread mutates shards — a flush, clean, or
//! split. The `mutate` mutex enforces this; `flush` merely try-locks it and
//! walks away when another thread is already making progress.
//!
//! Cleaning or splitting replaces the shard vector. That conflicts with
//! readers, so the `shards` reader-writer lock guards the *pointer* to the
//! current vector, not the vector itself: readers hold it just long enough
//! to clone the `Arc`, the mutator takes it exclusively only for the swap.
//! A reader may keep using an outdated vector; `get` tolerates that by
//! replaying the write log over whatever the shards returned, and the old
//! shard files are not unlinked before the replacement vector is published.
//!
//! The spare-shard pool has its own mutex so `preallocate` never blocks a
//! concurrent `flush`.

mod maintenance;
mod read;
mod recovery;
mod vector;
mod write;

pub use vector::ShardVector;

use hashspace::{Coordinate, SpaceHash, Xxh3Space};
use parking_lot::{Mutex, RwLock};
use shard::{Shard, ShardError};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use wal::WriteLog;

/// Upper bound on write-log entries drained per `flush` call, so many
/// worker threads can hammer `flush` in a loop without one of them
/// disappearing into an unbounded drain.
pub const FLUSH_BATCH: usize = 100;

/// Spare-shard pool size cap.
pub(crate) const SPARE_POOL_MAX: usize = 16;

/// A full shard with at least this much stale space is cleaned instead of
/// split.
pub(crate) const CLEAN_STALE_THRESHOLD: u32 = 30;

/// Errors surfaced by the disk. Full-shard conditions never appear here —
/// flush converts them into clean/split work. A missing value is `Ok(None)`
/// from [`Disk::get`], not an error.
#[derive(Debug, Error)]
pub enum DiskError {
    /// The value's attribute count does not match the disk schema.
    #[error("value arity does not match the disk schema")]
    WrongArity,

    /// msync failed on one or more shards.
    #[error("msync failed on one or more shards")]
    SyncFailed,

    /// A shard file or the directory could not be removed or renamed into
    /// place.
    #[error("failed to remove or rename shard files")]
    DropFailed,

    /// A full shard could not be subdivided; the layer above must reshard
    /// or shed load.
    #[error("full shard cannot be subdivided further")]
    SplitFailed,

    /// An underlying I/O error on the creation path.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<ShardError> for DiskError {
    fn from(e: ShardError) -> Self {
        match e {
            ShardError::SyncFailed(_) => DiskError::SyncFailed,
            ShardError::Io(e) => DiskError::Io(e),
            ShardError::WrongSize(n) => DiskError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shard file is {n} bytes"),
            )),
        }
    }
}

pub(crate) struct SparePool {
    /// Pre-created empty shard files, consumed front-first by rename.
    pub(crate) shards: VecDeque<(String, Arc<Shard>)>,
    pub(crate) counter: u64,
}

/// One on-disk store: a directory of shard files partitioning the 2-D hash
/// space, fed through an in-memory write log.
///
/// # Write Path
///
/// 1. `put`/`del` validate and append to the write log; they never touch a
///    shard, so they run concurrently with everything.
/// 2. `flush` drains the oldest log entries into the covering shards,
///    scrubbing older versions out of wider shards first.
/// 3. A full shard is cleaned (≥30% stale) or split four ways.
///
/// # Read Path
///
/// 1. Snapshot a write-log cursor, then the shard vector (in that order —
///    whatever the shard scan misses is still ahead of the cursor).
/// 2. Scan every shard whose coordinate covers the key.
/// 3. Replay the cursor; if the log mentions the key at all, the log's
///    verdict wins.
pub struct Disk {
    dir: PathBuf,
    /// Attribute count + 1. Writes with any other value arity are rejected.
    arity: u16,
    hasher: Arc<dyn SpaceHash>,
    /// Held by the sole mutator (flush/clean/split/destroy).
    mutate: Mutex<()>,
    /// Guards the pointer to the current shard vector, not its contents.
    shards: RwLock<Arc<ShardVector>>,
    log: WriteLog,
    spare: Mutex<SparePool>,
}

impl Disk {
    /// Opens the store in `dir` with the default hashing primitives,
    /// creating the directory (mode 0700) and the initial
    /// whole-space shard as needed. An existing directory is recovered:
    /// leftover temporary and spare files are deleted and live shards are
    /// reloaded from their coordinate filenames.
    pub fn open<P: AsRef<Path>>(dir: P, arity: u16) -> Result<Self, DiskError> {
        Self::open_with(dir, arity, Arc::new(Xxh3Space))
    }

    /// [`open`](Self::open) with injected hashing primitives.
    pub fn open_with<P: AsRef<Path>>(
        dir: P,
        arity: u16,
        hasher: Arc<dyn SpaceHash>,
    ) -> Result<Self, DiskError> {
        let dir = dir.as_ref().to_path_buf();
        recovery::create_directory(&dir)?;
        recovery::remove_leftovers(&dir);

        let vector = match recovery::load_existing_shards(&dir)? {
            Some(vector) => vector,
            None => {
                let start = Coordinate::everything();
                let shard = Shard::create(&dir.join(recovery::shard_filename(&start)))?;
                ShardVector::new(start, Arc::new(shard))
            }
        };

        info!(dir = %dir.display(), shards = vector.len(), "opened disk");

        Ok(Self {
            dir,
            arity,
            hasher,
            mutate: Mutex::new(()),
            shards: RwLock::new(Arc::new(vector)),
            log: WriteLog::new(),
            spare: Mutex::new(SparePool {
                shards: VecDeque::new(),
                counter: 0,
            }),
        })
    }

    /// Schedules asynchronous writeback on every shard.
    pub fn schedule_sync(&self) -> Result<(), DiskError> {
        let shards = self.current_shards();
        let mut ret = Ok(());
        for i in 0..shards.len() {
            if shards.shard(i).flush_async().is_err() {
                ret = Err(DiskError::SyncFailed);
            }
        }
        ret
    }

    /// Synchronously writes every shard back to disk.
    pub fn sync(&self) -> Result<(), DiskError> {
        let shards = self.current_shards();
        let mut ret = Ok(());
        for i in 0..shards.len() {
            if shards.shard(i).flush().is_err() {
                ret = Err(DiskError::SyncFailed);
            }
        }
        ret
    }

    /// Number of shards in the current vector.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.current_shards().len()
    }

    /// True while the write log holds entries not yet drained into shards.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.log.is_empty()
    }

    /// The schema arity (attribute count + 1) this disk was opened with.
    #[must_use]
    pub fn arity(&self) -> u16 {
        self.arity
    }

    pub(crate) fn current_shards(&self) -> Arc<ShardVector> {
        self.shards.read().clone()
    }
}

impl std::fmt::Debug for Disk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disk")
            .field("dir", &self.dir)
            .field("arity", &self.arity)
            .field("shard_count", &self.shard_count())
            .field("pending_writes", &self.has_pending_writes())
            .finish()
    }
}

#[cfg(test)]
mod tests;
