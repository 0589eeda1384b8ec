//! Forward iteration over a shard's live entries.

use crate::{Shard, SEARCH_INDEX_ENTRIES};

/// A single-pass cursor over the live search-log entries that existed when
/// the snapshot was taken. Entries superseded before the snapshot are
/// skipped; recreate the snapshot to restart.
pub struct ShardSnapshot<'a> {
    shard: &'a Shard,
    /// One past the last search-log entry this snapshot may visit.
    limit: usize,
    cursor: usize,
}

impl<'a> ShardSnapshot<'a> {
    pub(crate) fn new(shard: &'a Shard) -> Self {
        Self {
            shard,
            limit: shard.search_entries(),
            cursor: 0,
        }
    }
}

impl<'a> Iterator for ShardSnapshot<'a> {
    type Item = SnapshotEntry<'a>;

    fn next(&mut self) -> Option<SnapshotEntry<'a>> {
        while self.cursor < self.limit {
            let entry = self.cursor;
            self.cursor += 1;
            debug_assert!(entry < SEARCH_INDEX_ENTRIES);

            let word1 = self.shard.log_word(entry, 1);
            let offset = word1 as u32;
            if offset == 0 {
                // Dense log: nothing follows a zero offset.
                self.cursor = self.limit;
                return None;
            }
            if (word1 >> 32) as u32 != 0 {
                continue;
            }

            let word0 = self.shard.log_word(entry, 0);
            return Some(SnapshotEntry {
                shard: self.shard,
                offset,
                hashes: word0,
            });
        }
        None
    }
}

/// One live record seen through a [`ShardSnapshot`].
pub struct SnapshotEntry<'a> {
    shard: &'a Shard,
    offset: u32,
    hashes: u64,
}

impl<'a> SnapshotEntry<'a> {
    pub fn primary_hash(&self) -> u32 {
        self.hashes as u32
    }

    pub fn secondary_hash(&self) -> u32 {
        (self.hashes >> 32) as u32
    }

    pub fn key(&self) -> &'a [u8] {
        self.shard.data_key(self.offset)
    }

    pub fn value(&self) -> Vec<Vec<u8>> {
        self.shard
            .data_value(self.offset, self.shard.data_key_size(self.offset))
    }

    pub fn version(&self) -> u64 {
        self.shard.data_version(self.offset)
    }
}
