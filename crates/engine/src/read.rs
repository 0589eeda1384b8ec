/// Read path: `get()`.
///
/// A lookup scans every shard whose coordinate covers the key, then replays
/// the write log on top. The cursor is snapshotted *before* the shard scan:
/// any write the shards haven't absorbed yet is then guaranteed to still be
/// ahead of the cursor, so the log's verdict is definitionally newer than
/// anything the shards returned — even across a racing vector swap.
use crate::{Disk, DiskError};
use hashspace::key_coordinate;

impl Disk {
    /// Looks up a key, returning `Some((value, version))` if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<Vec<u8>>, u64)>, DiskError> {
        let coord = key_coordinate(self.hasher.as_ref(), key);

        // Cursor first, then the vector.
        let cursor = self.log.iterate();
        let shards = self.current_shards();

        let mut shard_result = None;
        for i in 0..shards.len() {
            if !shards.coordinate(i).primary_contains(&coord) {
                continue;
            }
            if let Some(found) = shards.shard(i).get(coord.primary_hash, key) {
                shard_result = Some(found);
                break;
            }
        }

        // Replay the log to completion; its last word on the key wins.
        let mut log_saw_key = false;
        let mut log_result = None;
        for entry in cursor {
            if entry.coord.primary_contains(&coord) && entry.key == key {
                log_saw_key = true;
                log_result = if entry.is_tombstone() {
                    None
                } else {
                    Some((entry.value.clone(), entry.version))
                };
            }
        }

        Ok(if log_saw_key { log_result } else { shard_result })
    }
}
