//! The immutable shard vector: an ordered list of `(coordinate, shard)`
//! pairs partitioning the hash space.
//!
//! Ordering is significant. The starting vector holds one shard covering
//! everything; each split writes its four successors at the predecessor's
//! position, so narrower shards always sit behind wider ones. The flush
//! path scans back-to-front and therefore lands new records in the
//! narrowest cover, while `get` scans every cover so records not yet copied
//! out of a wider shard stay reachable until that shard is dropped.
//!
//! The vector itself is never mutated; maintenance builds a replacement and
//! swaps the disk's pointer under its write lock.

use hashspace::Coordinate;
use shard::Shard;
use std::sync::Arc;

pub struct ShardVector {
    entries: Vec<(Coordinate, Arc<Shard>)>,
}

impl ShardVector {
    pub fn new(coord: Coordinate, shard: Arc<Shard>) -> Self {
        Self {
            entries: vec![(coord, shard)],
        }
    }

    pub(crate) fn from_entries(entries: Vec<(Coordinate, Arc<Shard>)>) -> Self {
        debug_assert!(!entries.is_empty());
        Self { entries }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn coordinate(&self, i: usize) -> Coordinate {
        self.entries[i].0
    }

    pub fn shard(&self, i: usize) -> &Arc<Shard> {
        &self.entries[i].1
    }

    /// A new vector with entry `i`'s shard substituted one-for-one. The
    /// coordinate is unchanged; this is the clean path.
    pub fn replace(&self, i: usize, shard: Arc<Shard>) -> ShardVector {
        let mut entries = self.entries.clone();
        entries[i].1 = shard;
        ShardVector { entries }
    }

    /// A new vector with entry `i` substituted by its four split
    /// successors, in place.
    pub fn replace4(&self, i: usize, successors: [(Coordinate, Arc<Shard>); 4]) -> ShardVector {
        let mut entries = Vec::with_capacity(self.entries.len() + 3);
        entries.extend_from_slice(&self.entries[..i]);
        entries.extend(successors);
        entries.extend_from_slice(&self.entries[i + 1..]);
        ShardVector { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    fn test_shard(dir: &std::path::Path, name: &str) -> Arc<Shard> {
        Arc::new(Shard::create(&dir.join(name)).unwrap())
    }

    #[test]
    fn replace_substitutes_in_place() -> Result<()> {
        let dir = tempdir()?;
        let a = Coordinate::new(0, 0, 0, 0);
        let vector = ShardVector::new(a, test_shard(dir.path(), "a"));

        let replacement = test_shard(dir.path(), "b");
        let next = vector.replace(0, replacement.clone());
        assert_eq!(next.len(), 1);
        assert_eq!(next.coordinate(0), a);
        assert!(Arc::ptr_eq(next.shard(0), &replacement));
        // The original vector is untouched.
        assert!(!Arc::ptr_eq(vector.shard(0), &replacement));
        Ok(())
    }

    #[test]
    fn replace4_expands_at_position() -> Result<()> {
        let dir = tempdir()?;
        let wide = Coordinate::new(0, 0, 0, 0);
        let other = Coordinate::new(1, 1, 0, 0);
        let vector = ShardVector::from_entries(vec![
            (other, test_shard(dir.path(), "other")),
            (wide, test_shard(dir.path(), "wide")),
        ]);

        let successors: Vec<(Coordinate, Arc<Shard>)> = (0..4)
            .map(|n| {
                (
                    Coordinate::new(0b11, n, 0b1, n & 1),
                    test_shard(dir.path(), &format!("s{n}")),
                )
            })
            .collect();
        let successors: [(Coordinate, Arc<Shard>); 4] = successors.try_into().ok().unwrap();

        let next = vector.replace4(1, successors);
        assert_eq!(next.len(), 5);
        assert_eq!(next.coordinate(0), other);
        for n in 0..4u32 {
            assert_eq!(next.coordinate(1 + n as usize), Coordinate::new(0b11, n, 0b1, n & 1));
        }
        Ok(())
    }
}
