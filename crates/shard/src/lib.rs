//! # Shard — Fixed-Size Memory-Mapped Record Files
//!
//! A shard is one file of exactly [`FILE_SIZE`] bytes holding the records
//! whose hash-space coordinates fall inside the shard's rectangle. The file
//! is mapped read/write and interpreted as three regions:
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ HASH TABLE                   │   open-addressed, linear probing
//! │   slot: (offset<<32) | phash │   slot index = phash mod entries
//! ├──────────────────────────────┤ HASH_TABLE_SIZE
//! │ SEARCH LOG                   │   append-only, insertion order
//! │   word0: (shash<<32) | phash │
//! │   word1: (invalidator<<32)   │   invalidator != 0 → superseded
//! │          | data_offset       │   data_offset == 0 → end of log
//! ├──────────────────────────────┤ INDEX_SEGMENT_SIZE
//! │ DATA HEAP                    │   8-byte aligned records:
//! │                              │   version u64 | key_size u32 | key
//! │                              │   | arity u16 | (size u32 | attr)*
//! └──────────────────────────────┘ FILE_SIZE
//! ```
//!
//! All words are little-endian. The heap is append-only: overwrites and
//! deletes leave the old bytes in place and mark the search-log entry
//! invalidated; the space is reclaimed only by [`Shard::copy_to`].
//!
//! ## Concurrency
//!
//! A shard is mutated by at most one thread at a time (the engine's
//! maintenance mutex enforces this); readers run concurrently without locks.
//! Index words are accessed through atomic views into the mapping: a record's
//! heap bytes are fully written before its offset is published with `Release`,
//! and probes load with `Acquire`, so a reader that sees an offset sees the
//! record behind it. Readers racing with an in-flight overwrite may observe
//! either version; the engine's write log arbitrates.

mod constants;
mod snapshot;

pub use constants::*;
pub use snapshot::{ShardSnapshot, SnapshotEntry};

use byteorder::{ByteOrder, LittleEndian};
use hashspace::Coordinate;
use memmap2::{MmapMut, MmapOptions};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

/// Errors raised by shard I/O. Full-shard conditions are not errors; they
/// are [`PutStatus`]/[`DelStatus`] outcomes the engine turns into
/// maintenance work.
#[derive(Debug, Error)]
pub enum ShardError {
    /// An underlying I/O error while creating or opening the file.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An existing file does not have the fixed shard size.
    #[error("shard file is {0} bytes, expected {FILE_SIZE}")]
    WrongSize(u64),

    /// msync of the mapping failed.
    #[error("msync failed: {0}")]
    SyncFailed(io::Error),
}

/// Outcome of [`Shard::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Success,
    /// The record does not fit in the data heap.
    DataFull,
    /// The search log is out of entries.
    SearchFull,
}

/// Outcome of [`Shard::del`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelStatus {
    Success,
    NotFound,
    /// No room left for the deletion watermark.
    DataFull,
}

/// One mapped shard file.
pub struct Shard {
    #[allow(dead_code)]
    mmap: MmapMut, // keeps the mapping alive; all access goes through `base`
    base: *mut u8,
    /// Next free byte in the data heap. Monotonic, 8-byte aligned.
    data_offset: AtomicU32,
    /// Next free search-log entry.
    search_offset: AtomicU32,
}

// The raw pointer aliases the mapping above. Index words are only touched
// through atomic views, and heap bytes are published before their offsets,
// so shared access from multiple threads is sound under the engine's
// single-mutator discipline.
unsafe impl Send for Shard {}
unsafe impl Sync for Shard {}

/// Bytes a record occupies in the data heap.
pub fn data_size(key: &[u8], value: &[Vec<u8>]) -> usize {
    8 + 4 + key.len() + 2 + value.iter().map(|a| 4 + a.len()).sum::<usize>()
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

impl Shard {
    /// Creates a zero-filled shard file of exactly [`FILE_SIZE`] bytes,
    /// replacing any stale file at the same path, and maps it.
    pub fn create(path: &Path) -> Result<Self, ShardError> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(FILE_SIZE as u64)?;
        file.sync_all()?;

        Self::map(&file)
    }

    /// Maps an existing shard file and rebuilds the in-memory offsets by
    /// scanning the search log: the log is dense, so the first zero data
    /// offset marks its end, and the last entry's record sizes the heap.
    pub fn open(path: &Path) -> Result<Self, ShardError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != FILE_SIZE as u64 {
            return Err(ShardError::WrongSize(len));
        }

        let shard = Self::map(&file)?;

        let mut search_offset = 0usize;
        let mut data_offset = INDEX_SEGMENT_SIZE as u32;
        while search_offset < SEARCH_INDEX_ENTRIES {
            let offset = shard.log_word(search_offset, 1) as u32;
            if offset == 0 {
                break;
            }
            data_offset = offset;
            search_offset += 1;
        }

        if search_offset > 0 {
            let size = shard.data_record_size(data_offset);
            data_offset = align8(data_offset as usize + size) as u32;
            debug_assert!(data_offset as usize <= FILE_SIZE);
        }

        shard.search_offset.store(search_offset as u32, Ordering::Relaxed);
        shard.data_offset.store(data_offset, Ordering::Relaxed);
        Ok(shard)
    }

    fn map(file: &fs::File) -> Result<Self, ShardError> {
        // Safety: the file is never truncated while mapped, and the mapping
        // is private to this process.
        let mut mmap = unsafe { MmapOptions::new().len(FILE_SIZE).map_mut(file)? };
        let base = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            base,
            data_offset: AtomicU32::new(INDEX_SEGMENT_SIZE as u32),
            search_offset: AtomicU32::new(0),
        })
    }

    /// Appends a record and publishes it in the search log and hash table.
    ///
    /// Returns [`PutStatus::DataFull`]/[`PutStatus::SearchFull`] with no
    /// state change when the record or its index entry does not fit.
    pub fn put(
        &self,
        primary_hash: u32,
        secondary_hash: u32,
        key: &[u8],
        value: &[Vec<u8>],
        version: u64,
    ) -> PutStatus {
        let size = data_size(key, value);
        let data_offset = self.data_offset.load(Ordering::Relaxed) as usize;
        if data_offset + size > FILE_SIZE {
            return PutStatus::DataFull;
        }

        let search_offset = self.search_offset.load(Ordering::Relaxed) as usize;
        if search_offset == SEARCH_INDEX_ENTRIES {
            return PutStatus::SearchFull;
        }

        let (bucket, slot) = self.hash_lookup(primary_hash, key);

        // Pack the record into the heap before publishing any index word.
        let buf = self.bytes_mut(data_offset, size);
        let mut at = 0usize;
        LittleEndian::write_u64(&mut buf[at..at + 8], version);
        at += 8;
        LittleEndian::write_u32(&mut buf[at..at + 4], key.len() as u32);
        at += 4;
        buf[at..at + key.len()].copy_from_slice(key);
        at += key.len();
        LittleEndian::write_u16(&mut buf[at..at + 2], value.len() as u16);
        at += 2;
        for attr in value {
            LittleEndian::write_u32(&mut buf[at..at + 4], attr.len() as u32);
            at += 4;
            buf[at..at + attr.len()].copy_from_slice(attr);
            at += attr.len();
        }
        debug_assert_eq!(at, size);

        // A live earlier version of this key gets superseded by this write.
        let slot_offset = (slot >> 32) as u32;
        if slot_offset != 0 && slot_offset < HASH_OFFSET_INVALID {
            self.invalidate_search_log(slot_offset, data_offset as u32);
        }

        self.store_log_word(
            search_offset,
            0,
            ((secondary_hash as u64) << 32) | primary_hash as u64,
        );
        self.store_log_word(search_offset, 1, data_offset as u64);
        self.store_hash_slot(bucket, ((data_offset as u64) << 32) | primary_hash as u64);

        self.search_offset
            .store(search_offset as u32 + 1, Ordering::Release);

        let new_data_offset = align8(data_offset + size);

        // Schedule writeback whenever the heap crosses a 4 MiB boundary.
        if data_offset / MSYNC_INTERVAL != new_data_offset / MSYNC_INTERVAL {
            let _ = self.flush_async();
        }

        self.data_offset
            .store(new_data_offset as u32, Ordering::Release);
        PutStatus::Success
    }

    /// Point lookup. The probe verifies the key, so the record is decoded
    /// without re-comparing it.
    pub fn get(&self, primary_hash: u32, key: &[u8]) -> Option<(Vec<Vec<u8>>, u64)> {
        let (_bucket, slot) = self.hash_lookup(primary_hash, key);
        let slot_offset = (slot >> 32) as u32;
        if slot_offset == 0 || slot_offset >= HASH_OFFSET_INVALID {
            return None;
        }
        let version = self.data_version(slot_offset);
        let value = self.data_value(slot_offset, key.len());
        Some((value, version))
    }

    /// Marks the key's current record superseded and tombstones its hash
    /// slot. The heap advances by one 8-byte watermark so that stale-space
    /// accounting keeps converging under delete-heavy load.
    pub fn del(&self, primary_hash: u32, key: &[u8]) -> DelStatus {
        let (bucket, slot) = self.hash_lookup(primary_hash, key);
        let slot_offset = (slot >> 32) as u32;
        if slot_offset == 0 || slot_offset >= HASH_OFFSET_INVALID {
            return DelStatus::NotFound;
        }

        let data_offset = self.data_offset.load(Ordering::Relaxed);
        if data_offset as usize + 8 > FILE_SIZE {
            return DelStatus::DataFull;
        }

        self.invalidate_search_log(slot_offset, data_offset);
        self.data_offset.store(data_offset + 8, Ordering::Release);
        // Keep the slot occupied by this key forever; only flag it invalid.
        self.store_hash_slot(
            bucket,
            (((slot_offset | HASH_OFFSET_INVALID) as u64) << 32) | primary_hash as u64,
        );
        DelStatus::Success
    }

    /// Percentage (0..=100) of this shard consumed by superseded records,
    /// as the max of the stale-byte and stale-entry ratios. Each entry's
    /// byte span runs from its offset to the next entry's offset, or to the
    /// heap watermark at the tail.
    pub fn stale_space(&self) -> u32 {
        let data_offset = self.data_offset.load(Ordering::Acquire);
        let mut stale_bytes = 0u64;
        let mut stale_entries = 0u64;

        for ent in 0..SEARCH_INDEX_ENTRIES {
            let word = self.log_word(ent, 1);
            let offset = word as u32;
            if offset == 0 {
                break;
            }
            if (word >> 32) as u32 != 0 {
                let end = if ent + 1 < SEARCH_INDEX_ENTRIES {
                    match self.log_word(ent + 1, 1) as u32 {
                        0 => data_offset,
                        next => next,
                    }
                } else {
                    data_offset
                };
                // A racing append can leave this view torn (preallocate
                // scans without the mutation lock); clamp rather than wrap.
                stale_bytes += end.saturating_sub(offset) as u64;
                stale_entries += 1;
            }
        }

        let data = 100 * stale_bytes / DATA_SEGMENT_SIZE as u64;
        let num = 100 * stale_entries / SEARCH_INDEX_ENTRIES as u64;
        data.max(num) as u32
    }

    /// Percentage (0..=100) of this shard's capacity in use, as the max of
    /// the heap and search-log ratios.
    pub fn used_space(&self) -> u32 {
        let data_offset = self.data_offset.load(Ordering::Relaxed) as u64;
        let search_offset = self.search_offset.load(Ordering::Relaxed) as u64;
        let data = 100 * (data_offset - INDEX_SEGMENT_SIZE as u64) / DATA_SEGMENT_SIZE as u64;
        let num = 100 * search_offset / SEARCH_INDEX_ENTRIES as u64;
        data.max(num) as u32
    }

    pub fn free_space(&self) -> u32 {
        100 - self.used_space()
    }

    /// Rebuilds `dst` with the live records whose point coordinate
    /// intersects `coord`, preserving insertion order. `dst`'s index is
    /// zeroed first; record bytes are copied verbatim.
    pub fn copy_to(&self, coord: &Coordinate, dst: &Shard) {
        debug_assert!(!std::ptr::eq(self, dst));

        dst.bytes_mut(0, INDEX_SEGMENT_SIZE).fill(0);
        dst.data_offset
            .store(INDEX_SEGMENT_SIZE as u32, Ordering::Release);
        dst.search_offset.store(0, Ordering::Release);

        let src_data_offset = self.data_offset.load(Ordering::Acquire);

        for ent in 0..SEARCH_INDEX_ENTRIES {
            let word1 = self.log_word(ent, 1);
            let entry_start = word1 as u32;
            if entry_start == 0 {
                break;
            }
            // Superseded entries stay behind.
            if (word1 >> 32) as u32 != 0 {
                continue;
            }

            let word0 = self.log_word(ent, 0);
            let primary_hash = word0 as u32;
            let secondary_hash = (word0 >> 32) as u32;
            if !coord.intersects(&Coordinate::point(primary_hash, secondary_hash)) {
                continue;
            }

            let entry_end = if ent + 1 < SEARCH_INDEX_ENTRIES {
                match self.log_word(ent + 1, 1) as u32 {
                    0 => src_data_offset,
                    next => next,
                }
            } else {
                src_data_offset
            };
            debug_assert!(entry_start <= entry_end);
            debug_assert!(entry_end as usize <= FILE_SIZE);

            let len = (entry_end - entry_start) as usize;
            let dst_offset = dst.data_offset.load(Ordering::Relaxed) as usize;
            debug_assert!(dst_offset + len <= FILE_SIZE);
            dst.bytes_mut(dst_offset, len)
                .copy_from_slice(self.bytes(entry_start as usize, len));

            let dst_entry = dst.search_offset.load(Ordering::Relaxed) as usize;
            dst.store_log_word(dst_entry, 0, word0);
            dst.store_log_word(dst_entry, 1, dst_offset as u64);
            let bucket = dst.hash_lookup_empty(primary_hash);
            dst.store_hash_slot(bucket, ((dst_offset as u64) << 32) | primary_hash as u64);

            dst.search_offset
                .store(dst_entry as u32 + 1, Ordering::Release);
            dst.data_offset
                .store(align8(dst_offset + len) as u32, Ordering::Release);
        }
    }

    /// A forward cursor over the live entries present right now.
    pub fn make_snapshot(&self) -> ShardSnapshot<'_> {
        ShardSnapshot::new(self)
    }

    /// Schedules asynchronous writeback of the whole mapping.
    pub fn flush_async(&self) -> Result<(), ShardError> {
        self.mmap.flush_async().map_err(ShardError::SyncFailed)
    }

    /// Synchronous writeback of the whole mapping.
    pub fn flush(&self) -> Result<(), ShardError> {
        self.mmap.flush().map_err(ShardError::SyncFailed)
    }

    /// Structural self-check: the search log's trailing zero run must be
    /// entirely zero, and every earlier entry must either be referenced by
    /// the hash table at its own offset or be invalidated.
    pub fn fsck(&self) -> bool {
        let mut sink = String::new();
        self.fsck_report(&mut sink)
    }

    /// [`fsck`](Self::fsck) with a human-readable account of each violation.
    pub fn fsck_report(&self, err: &mut dyn std::fmt::Write) -> bool {
        let mut ok = true;
        let mut tail = false;

        for ent in 0..SEARCH_INDEX_ENTRIES {
            let hashes = self.log_word(ent, 0);
            let offsets = self.log_word(ent, 1);

            if offsets as u32 == 0 {
                tail = true;
            }

            if tail {
                if offsets != 0 {
                    let _ = writeln!(
                        err,
                        "entry {ent}: no offset but invalidated at {}",
                        (offsets >> 32) as u32
                    );
                    ok = false;
                }
                if hashes != 0 {
                    let _ = writeln!(
                        err,
                        "entry {ent}: no offset but non-zero hashes {:#x}",
                        hashes
                    );
                    ok = false;
                }
                continue;
            }

            let offset = offsets as u32;
            let invalidated = (offsets >> 32) as u32 != 0;
            let key = self.data_key(offset);
            let (bucket, slot) = self.hash_lookup(hashes as u32, key);
            let slot_hash = slot as u32;
            let slot_offset = (slot >> 32) as u32;

            if slot_hash == hashes as u32 && slot_offset != 0 {
                if !invalidated && (slot_offset & !HASH_OFFSET_INVALID) != offset {
                    let _ = writeln!(
                        err,
                        "entry {ent}: log offset {offset} disagrees with hash slot {bucket} \
                         holding {}",
                        slot_offset & !HASH_OFFSET_INVALID
                    );
                    ok = false;
                }
            } else if !invalidated {
                let _ = writeln!(
                    err,
                    "entry {ent}: live entry at offset {offset} is not referenced by the \
                     hash table"
                );
                ok = false;
            }
        }

        ok
    }

    // ---------------- typed views into the mapping ----------------

    fn hash_slot(&self, bucket: usize) -> u64 {
        debug_assert!(bucket < HASH_TABLE_ENTRIES);
        // Safety: bucket is in range and the slot is 8-byte aligned.
        let slot = unsafe { &*(self.base.add(bucket * 8) as *const AtomicU64) };
        u64::from_le(slot.load(Ordering::Acquire))
    }

    fn store_hash_slot(&self, bucket: usize, value: u64) {
        debug_assert!(bucket < HASH_TABLE_ENTRIES);
        let slot = unsafe { &*(self.base.add(bucket * 8) as *const AtomicU64) };
        slot.store(value.to_le(), Ordering::Release);
    }

    pub(crate) fn log_word(&self, entry: usize, word: usize) -> u64 {
        debug_assert!(entry < SEARCH_INDEX_ENTRIES && word < 2);
        let at = HASH_TABLE_SIZE + entry * 16 + word * 8;
        let slot = unsafe { &*(self.base.add(at) as *const AtomicU64) };
        u64::from_le(slot.load(Ordering::Acquire))
    }

    fn store_log_word(&self, entry: usize, word: usize, value: u64) {
        debug_assert!(entry < SEARCH_INDEX_ENTRIES && word < 2);
        let at = HASH_TABLE_SIZE + entry * 16 + word * 8;
        let slot = unsafe { &*(self.base.add(at) as *const AtomicU64) };
        slot.store(value.to_le(), Ordering::Release);
    }

    fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= FILE_SIZE);
        // Safety: in-bounds; published regions of the heap are never
        // rewritten, so shared reads do not race.
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= FILE_SIZE);
        // Safety: in-bounds; callers run under the engine's single-mutator
        // discipline and only write bytes no published offset points at.
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset), len) }
    }

    // ---------------- record decoding ----------------

    pub(crate) fn data_version(&self, offset: u32) -> u64 {
        debug_assert_eq!(offset & 7, 0);
        LittleEndian::read_u64(self.bytes(offset as usize, 8))
    }

    pub(crate) fn data_key_size(&self, offset: u32) -> usize {
        LittleEndian::read_u32(self.bytes(offset as usize + 8, 4)) as usize
    }

    pub(crate) fn data_key(&self, offset: u32) -> &[u8] {
        let size = self.data_key_size(offset);
        self.bytes(offset as usize + 12, size)
    }

    pub(crate) fn data_value(&self, offset: u32, key_size: usize) -> Vec<Vec<u8>> {
        let mut at = offset as usize + 12 + key_size;
        let arity = LittleEndian::read_u16(self.bytes(at, 2)) as usize;
        at += 2;
        let mut value = Vec::with_capacity(arity);
        for _ in 0..arity {
            let size = LittleEndian::read_u32(self.bytes(at, 4)) as usize;
            at += 4;
            value.push(self.bytes(at, size).to_vec());
            at += size;
        }
        value
    }

    /// Total heap bytes of the record at `offset`, decoded from its own
    /// headers. Used when reopening a shard.
    fn data_record_size(&self, offset: u32) -> usize {
        let key_size = self.data_key_size(offset);
        let mut at = offset as usize + 12 + key_size;
        let arity = LittleEndian::read_u16(self.bytes(at, 2)) as usize;
        at += 2;
        for _ in 0..arity {
            let size = LittleEndian::read_u32(self.bytes(at, 4)) as usize;
            at += 4 + size;
        }
        at - offset as usize
    }

    // ---------------- hash table probing ----------------

    /// Probes for `key`, stopping at its slot (live or tombstoned) or at the
    /// first empty slot. Once a slot is assigned to a key it is never
    /// reassigned, so the probe path for a key is stable for the life of
    /// the shard.
    fn hash_lookup(&self, primary_hash: u32, key: &[u8]) -> (usize, u64) {
        let start = primary_hash as usize & (HASH_TABLE_ENTRIES - 1);

        for probe in 0..HASH_TABLE_ENTRIES {
            let bucket = (start + probe) & (HASH_TABLE_ENTRIES - 1);
            let slot = self.hash_slot(bucket);
            let slot_offset = (slot >> 32) as u32;

            if slot_offset == 0 {
                return (bucket, slot);
            }

            if slot as u32 == primary_hash {
                let offset = slot_offset & !HASH_OFFSET_INVALID;
                if self.data_key(offset) == key {
                    return (bucket, slot);
                }
            }
        }

        unreachable!("hash table denser than the search log permits");
    }

    /// Probes for the first empty slot. Only valid while rebuilding a fresh
    /// shard, where every key is inserted at most once.
    fn hash_lookup_empty(&self, primary_hash: u32) -> usize {
        let start = primary_hash as usize & (HASH_TABLE_ENTRIES - 1);

        for probe in 0..HASH_TABLE_ENTRIES {
            let bucket = (start + probe) & (HASH_TABLE_ENTRIES - 1);
            if (self.hash_slot(bucket) >> 32) as u32 == 0 {
                return bucket;
            }
        }

        unreachable!("hash table denser than the search log permits");
    }

    /// Finds the search-log entry whose data offset is `to_invalidate` by
    /// binary search (offsets are strictly increasing, zeroes only at the
    /// tail) and records `invalidate_with` as its invalidator.
    fn invalidate_search_log(&self, to_invalidate: u32, invalidate_with: u32) {
        let mut low: i64 = 0;
        let mut high: i64 = SEARCH_INDEX_ENTRIES as i64 - 1;

        while low <= high {
            let mid = low + (high - low) / 2;
            let mid_offset = self.log_word(mid as usize, 1) as u32;

            if mid_offset == 0 || mid_offset > to_invalidate {
                high = mid - 1;
            } else if mid_offset < to_invalidate {
                low = mid + 1;
            } else {
                self.store_log_word(
                    mid as usize,
                    1,
                    ((invalidate_with as u64) << 32) | to_invalidate as u64,
                );
                return;
            }
        }
    }

    // ---------------- introspection for the engine and tests ----------------

    pub(crate) fn search_entries(&self) -> usize {
        self.search_offset.load(Ordering::Acquire) as usize
    }

    /// Current heap watermark. Exposed for diagnostics.
    pub fn data_watermark(&self) -> u32 {
        self.data_offset.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("search_entries", &self.search_entries())
            .field("data_watermark", &self.data_watermark())
            .field("used_space", &self.used_space())
            .field("stale_space", &self.stale_space())
            .finish()
    }
}

#[cfg(test)]
mod tests;
