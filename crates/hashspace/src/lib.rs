//! # Hashspace — 2-D Hash-Space Coordinates
//!
//! Every record in the store is placed at a point in a two-dimensional hash
//! space: the *primary* axis is derived from the key, the *secondary* axis
//! from the value. Shards cover axis-aligned rectangles of that space,
//! described by a [`Coordinate`] — a pair of prefix regions, one per axis.
//!
//! A prefix region `(mask, hash)` denotes every 32-bit point `x` with
//! `x & mask == hash & mask`. A coordinate with both masks equal to
//! `u32::MAX` is a single point; a coordinate with `secondary_mask == 0`
//! matches on the key alone and is used as a delete tombstone.
//!
//! The hashing primitives themselves are injected through [`SpaceHash`];
//! the engine never fixes their algorithm. [`Xxh3Space`] is the default
//! implementation.

use xxhash_rust::xxh3::xxh3_64;

/// A rectangle in the 2-D hash space: one prefix region per axis.
///
/// Hashes are stored pre-masked (`hash & mask == hash`), so region
/// comparisons reduce to mask-and-compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub primary_mask: u32,
    pub primary_hash: u32,
    pub secondary_mask: u32,
    pub secondary_hash: u32,
}

impl Coordinate {
    /// Builds a coordinate, normalizing each hash by its mask.
    pub fn new(
        primary_mask: u32,
        primary_hash: u32,
        secondary_mask: u32,
        secondary_hash: u32,
    ) -> Self {
        Self {
            primary_mask,
            primary_hash: primary_hash & primary_mask,
            secondary_mask,
            secondary_hash: secondary_hash & secondary_mask,
        }
    }

    /// The coordinate covering the entire hash space.
    pub fn everything() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// A single point: both axes fully specified.
    pub fn point(primary_hash: u32, secondary_hash: u32) -> Self {
        Self::new(u32::MAX, primary_hash, u32::MAX, secondary_hash)
    }

    /// A key-only coordinate: matches any secondary hash. Used for lookups
    /// and delete tombstones.
    pub fn key_only(primary_hash: u32) -> Self {
        Self::new(u32::MAX, primary_hash, 0, 0)
    }

    /// True when both axes are fully specified.
    pub fn is_point(&self) -> bool {
        self.primary_mask == u32::MAX && self.secondary_mask == u32::MAX
    }

    /// True when this coordinate's primary region contains the point
    /// coordinate `p`'s primary hash. `p` must be fully specified on the
    /// primary axis.
    pub fn primary_contains(&self, p: &Coordinate) -> bool {
        p.primary_mask == u32::MAX && (p.primary_hash & self.primary_mask) == self.primary_hash
    }

    /// True when this coordinate contains the point `p` on both axes.
    pub fn contains(&self, p: &Coordinate) -> bool {
        self.primary_contains(p)
            && p.secondary_mask == u32::MAX
            && (p.secondary_hash & self.secondary_mask) == self.secondary_hash
    }

    /// True when the two regions have a non-empty intersection on both axes.
    pub fn intersects(&self, other: &Coordinate) -> bool {
        let pm = self.primary_mask & other.primary_mask;
        let sm = self.secondary_mask & other.secondary_mask;
        (self.primary_hash & pm) == (other.primary_hash & pm)
            && (self.secondary_hash & sm) == (other.secondary_hash & sm)
    }
}

/// The injected hashing primitives: a 64-bit hash over byte strings and the
/// interlace function that folds per-attribute hashes into a single value.
pub trait SpaceHash: Send + Sync {
    /// Hashes an opaque byte string to 64 bits.
    fn hash_bytes(&self, bytes: &[u8]) -> u64;

    /// Folds a sequence of attribute hashes into one 64-bit value whose low
    /// 32 bits become the secondary hash.
    fn interlace(&self, hashes: &[u64]) -> u64;
}

/// Default [`SpaceHash`] backed by xxh3 with round-robin bit interleaving.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3Space;

impl SpaceHash for Xxh3Space {
    fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        xxh3_64(bytes)
    }

    fn interlace(&self, hashes: &[u64]) -> u64 {
        lower_interlace(hashes)
    }
}

/// Interleaves the low bits of the given hashes round-robin: output bit `i`
/// is bit `i / n` of hash `i % n`. An empty slice folds to zero.
pub fn lower_interlace(hashes: &[u64]) -> u64 {
    let n = hashes.len();
    if n == 0 {
        return 0;
    }
    let mut out = 0u64;
    for bit in 0..64 {
        let h = hashes[bit % n];
        out |= ((h >> (bit / n)) & 1) << bit;
    }
    out
}

/// The point coordinate of a record: primary from the key, secondary from
/// the interlaced attribute hashes.
pub fn record_coordinate(h: &dyn SpaceHash, key: &[u8], value: &[Vec<u8>]) -> Coordinate {
    let attr_hashes: Vec<u64> = value.iter().map(|a| h.hash_bytes(a)).collect();
    Coordinate::point(
        h.hash_bytes(key) as u32,
        h.interlace(&attr_hashes) as u32,
    )
}

/// The key-only coordinate used for lookups and tombstones.
pub fn key_coordinate(h: &dyn SpaceHash, key: &[u8]) -> Coordinate {
    Coordinate::key_only(h.hash_bytes(key) as u32)
}
