/// Write path: `put()`, `del()`, and the `flush()` drain loop.
///
/// Writers only append to the write log, so they run concurrently with
/// readers and with each other. `flush` is the single place log entries
/// move into shards; it try-locks the maintenance mutex and backs off when
/// another thread is already draining.
use crate::{Disk, DiskError, FLUSH_BATCH};
use hashspace::{key_coordinate, record_coordinate};
use shard::{DelStatus, PutStatus};
use wal::LogEntry;

impl Disk {
    /// Enqueues a write. The value must carry `arity - 1` attributes.
    pub fn put(&self, key: Vec<u8>, value: Vec<Vec<u8>>, version: u64) -> Result<(), DiskError> {
        if value.len() + 1 != self.arity as usize {
            return Err(DiskError::WrongArity);
        }
        let coord = record_coordinate(self.hasher.as_ref(), &key, &value);
        self.log.append(LogEntry::put(coord, key, value, version));
        Ok(())
    }

    /// Enqueues a delete tombstone.
    pub fn del(&self, key: Vec<u8>) -> Result<(), DiskError> {
        let coord = key_coordinate(self.hasher.as_ref(), &key);
        self.log.append(LogEntry::tombstone(coord, key));
        Ok(())
    }

    /// Drains up to [`FLUSH_BATCH`] of the oldest write-log entries into
    /// the shards.
    ///
    /// Returns immediately with `Ok` when another thread holds the
    /// maintenance mutex — progress is being made, just not by us. When a
    /// shard reports itself full, the entry stays queued, the shard is
    /// cleaned or split, and the call returns; the next flush retries the
    /// same entry against the replacement shards.
    ///
    /// Each entry is applied in two passes: a delete pass scrubs the key
    /// out of whichever covering shard holds it (front-to-back, so older
    /// wider copies die first), and for puts an insert pass walks
    /// back-to-front so the narrowest covering shard receives the record.
    pub fn flush(&self) -> Result<(), DiskError> {
        let Some(_mutating) = self.mutate.try_lock() else {
            return Ok(());
        };

        for _ in 0..FLUSH_BATCH {
            let Some(entry) = self.log.oldest() else {
                break;
            };
            let shards = self.current_shards();

            for i in 0..shards.len() {
                if !shards.coordinate(i).primary_contains(&entry.coord) {
                    continue;
                }
                match shards.shard(i).del(entry.coord.primary_hash, &entry.key) {
                    DelStatus::Success => break,
                    DelStatus::NotFound => {}
                    DelStatus::DataFull => return self.deal_with_full_shard(&shards, i),
                }
            }

            if !entry.is_tombstone() {
                let mut inserted = false;
                for i in (0..shards.len()).rev() {
                    if !shards.coordinate(i).contains(&entry.coord) {
                        continue;
                    }
                    match shards.shard(i).put(
                        entry.coord.primary_hash,
                        entry.coord.secondary_hash,
                        &entry.key,
                        &entry.value,
                        entry.version,
                    ) {
                        PutStatus::Success => {
                            inserted = true;
                            break;
                        }
                        PutStatus::DataFull | PutStatus::SearchFull => {
                            return self.deal_with_full_shard(&shards, i)
                        }
                    }
                }
                // The vector partitions the space; a record with no
                // covering shard is a programming error.
                assert!(inserted, "no shard covers {:?}", entry.coord);
            }

            self.log.remove_oldest();
        }

        Ok(())
    }
}
