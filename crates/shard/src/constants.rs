//! Shard file geometry. Every shard is exactly [`FILE_SIZE`] bytes:
//! hash table, then search log, then the data heap.

/// Total size of a shard file.
pub const FILE_SIZE: usize = 1 << 25;

/// Slots in the open-addressed hash table. Must be a power of two, and must
/// exceed [`SEARCH_INDEX_ENTRIES`] so that linear probing always reaches an
/// empty slot before the table can fill.
pub const HASH_TABLE_ENTRIES: usize = 1 << 18;

/// Bytes occupied by the hash table (8-byte slots).
pub const HASH_TABLE_SIZE: usize = HASH_TABLE_ENTRIES * 8;

/// Entries in the search log. Each entry is two 8-byte words.
pub const SEARCH_INDEX_ENTRIES: usize = 1 << 17;

/// Bytes occupied by the search log.
pub const SEARCH_INDEX_SIZE: usize = SEARCH_INDEX_ENTRIES * 16;

/// Offset where the data heap begins.
pub const INDEX_SEGMENT_SIZE: usize = HASH_TABLE_SIZE + SEARCH_INDEX_SIZE;

/// Bytes available to the data heap.
pub const DATA_SEGMENT_SIZE: usize = FILE_SIZE - INDEX_SEGMENT_SIZE;

/// Top bit of a hash-table offset field: the slot's key was deleted. The
/// slot keeps its key so later probes for the same key still stop here.
pub const HASH_OFFSET_INVALID: u32 = 1 << 31;

/// An asynchronous msync is scheduled each time the data heap crosses a
/// boundary of this many bytes.
pub const MSYNC_INTERVAL: usize = 1 << 22;

const _: () = assert!(HASH_TABLE_ENTRIES.is_power_of_two());
const _: () = assert!(HASH_TABLE_ENTRIES > SEARCH_INDEX_ENTRIES);
const _: () = assert!(FILE_SIZE < HASH_OFFSET_INVALID as usize);
const _: () = assert!(INDEX_SEGMENT_SIZE % 8 == 0);
