/// Full-shard handling: cleaning, four-way splits, the spare-shard pool,
/// and store teardown.
///
/// Everything here runs on the single mutator thread (under the `mutate`
/// mutex) except `preallocate`, which only touches the spare pool and the
/// filesystem and deliberately has its own lock.
use crate::{recovery, Disk, DiskError, ShardVector, CLEAN_STALE_THRESHOLD, SPARE_POOL_MAX};
use hashspace::Coordinate;
use shard::Shard;
use std::fs;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Disk {
    /// Routes a full shard to clean or split. The write-log entry that hit
    /// the full shard stays queued; the next flush retries it against the
    /// replacement shards.
    pub(crate) fn deal_with_full_shard(
        &self,
        shards: &Arc<ShardVector>,
        i: usize,
    ) -> Result<(), DiskError> {
        let coord = shards.coordinate(i);
        let stale = shards.shard(i).stale_space();

        if stale >= CLEAN_STALE_THRESHOLD {
            debug!(?coord, stale, "cleaning full shard");
            self.clean_shard(shards, i)
        } else if coord.primary_mask == u32::MAX || coord.secondary_mask == u32::MAX {
            // With one axis exhausted, a four-way split would mint pairs of
            // successors with identical coordinates and duplicate every
            // surviving record across them. The layer above must reshard.
            warn!(?coord, "full shard cannot be subdivided");
            Err(DiskError::SplitFailed)
        } else {
            debug!(?coord, "splitting full shard");
            self.split_shard(shards, i)
        }
    }

    /// Compacts shard `i` by copying its live records into a fresh file at
    /// the same coordinate, renaming it into place, and swapping the
    /// vector.
    fn clean_shard(&self, shards: &Arc<ShardVector>, i: usize) -> Result<(), DiskError> {
        let coord = shards.coordinate(i);
        let tmp_name = recovery::shard_tmp_filename(&coord);
        let replacement = self.create_tmp_shard(&coord)?;

        shards.shard(i).copy_to(&coord, &replacement);
        let vector = Arc::new(shards.replace(i, replacement));

        // The rename must land before the new vector becomes visible, so a
        // crash in between leaves the old file authoritative.
        if fs::rename(
            self.dir.join(&tmp_name),
            self.dir.join(recovery::shard_filename(&coord)),
        )
        .is_err()
        {
            let _ = fs::remove_file(self.dir.join(&tmp_name));
            return Err(DiskError::DropFailed);
        }

        *self.shards.write() = vector;
        info!(?coord, "cleaned shard");
        Ok(())
    }

    /// Replaces shard `i` with four successors subdividing its rectangle:
    /// one fresh secondary bit, and one fresh primary bit chosen
    /// independently for each secondary half. Bits are chosen to balance
    /// the live records as evenly as possible.
    fn split_shard(&self, shards: &Arc<ShardVector>, i: usize) -> Result<(), DiskError> {
        let coord = shards.coordinate(i);
        let source = shards.shard(i);

        // Pass 1: histogram the unfixed secondary bits over the live
        // records and take the most balanced one.
        let mut zeros = [0u64; 32];
        let mut ones = [0u64; 32];
        for entry in source.make_snapshot() {
            let hash = entry.secondary_hash();
            for bit in 0..32 {
                if coord.secondary_mask & (1 << bit) != 0 {
                    continue;
                }
                if hash & (1 << bit) != 0 {
                    ones[bit] += 1;
                } else {
                    zeros[bit] += 1;
                }
            }
        }
        let secondary_bit = 1u32 << which_to_split(coord.secondary_mask, &zeros, &ones);

        // Pass 2: with the secondary bit fixed, histogram the primary bits
        // separately for the two secondary halves.
        let mut zeros_lower = [0u64; 32];
        let mut ones_lower = [0u64; 32];
        let mut zeros_upper = [0u64; 32];
        let mut ones_upper = [0u64; 32];
        for entry in source.make_snapshot() {
            let (zeros, ones) = if entry.secondary_hash() & secondary_bit != 0 {
                (&mut zeros_upper, &mut ones_upper)
            } else {
                (&mut zeros_lower, &mut ones_lower)
            };
            let hash = entry.primary_hash();
            for bit in 0..32 {
                if coord.primary_mask & (1 << bit) != 0 {
                    continue;
                }
                if hash & (1 << bit) != 0 {
                    ones[bit] += 1;
                } else {
                    zeros[bit] += 1;
                }
            }
        }
        let lower_bit = 1u32 << which_to_split(coord.primary_mask, &zeros_lower, &ones_lower);
        let upper_bit = 1u32 << which_to_split(coord.primary_mask, &zeros_upper, &ones_upper);

        let lower_zero = Coordinate::new(
            coord.primary_mask | lower_bit,
            coord.primary_hash,
            coord.secondary_mask | secondary_bit,
            coord.secondary_hash,
        );
        let upper_zero = Coordinate::new(
            coord.primary_mask | upper_bit,
            coord.primary_hash,
            coord.secondary_mask | secondary_bit,
            coord.secondary_hash | secondary_bit,
        );
        let lower_one = Coordinate::new(
            coord.primary_mask | lower_bit,
            coord.primary_hash | lower_bit,
            coord.secondary_mask | secondary_bit,
            coord.secondary_hash,
        );
        let upper_one = Coordinate::new(
            coord.primary_mask | upper_bit,
            coord.primary_hash | upper_bit,
            coord.secondary_mask | secondary_bit,
            coord.secondary_hash | secondary_bit,
        );

        // Create and fill the four successors; every created file is
        // dropped again if anything later in the sequence fails.
        let mut created: Vec<Coordinate> = Vec::with_capacity(4);
        let outcome = (|| -> Result<Arc<ShardVector>, DiskError> {
            let mut make = |c: Coordinate| -> Result<(Coordinate, Arc<Shard>), DiskError> {
                let s = self.create_shard(&c)?;
                created.push(c);
                source.copy_to(&c, &s);
                Ok((c, s))
            };
            let s0 = make(lower_zero)?;
            let s1 = make(upper_zero)?;
            let s2 = make(lower_one)?;
            let s3 = make(upper_one)?;
            Ok(Arc::new(shards.replace4(i, [s0, s1, s2, s3])))
        })();

        match outcome {
            Ok(vector) => {
                *self.shards.write() = vector;
                let _ = self.drop_shard(&coord);
                info!(
                    ?coord,
                    secondary_bit, lower_bit, upper_bit, "split shard four ways"
                );
                Ok(())
            }
            Err(e) => {
                warn!(?coord, error = %e, "shard split failed");
                for c in &created {
                    let _ = self.drop_shard(c);
                }
                Err(DiskError::SplitFailed)
            }
        }
    }

    /// Tops up the spare-shard pool so that shard creation inside the
    /// flush path is usually just a rename. Demand is estimated from how
    /// full and how stale the current shards are:
    ///
    /// | free    | stale | spares |
    /// |---------|-------|--------|
    /// | ≤25     | any   | 0      |
    /// | ≤50     | any   | 1      |
    /// | ≤75     | ≥30   | 1      |
    /// | ≤75     | <30   | 2      |
    /// | >75     | ≥30   | 1      |
    /// | >75     | <30   | 4      |
    pub fn preallocate(&self) -> Result<(), DiskError> {
        if self.spare.lock().shards.len() >= SPARE_POOL_MAX {
            return Ok(());
        }

        let shards = self.current_shards();
        let mut demand = 0usize;
        for i in 0..shards.len() {
            let shard = shards.shard(i);
            let free = shard.free_space() as usize;
            let stale = shard.stale_space();

            demand += if free <= 25 {
                0
            } else if free <= 50 {
                1
            } else if free <= 75 {
                if stale >= CLEAN_STALE_THRESHOLD {
                    1
                } else {
                    2
                }
            } else if stale >= CLEAN_STALE_THRESHOLD {
                1
            } else {
                4
            };
        }

        let needed = demand.saturating_sub(self.spare.lock().shards.len());
        for _ in 0..needed {
            let name = {
                let mut pool = self.spare.lock();
                let name = format!("spare-{}", pool.counter);
                pool.counter += 1;
                name
            };
            let shard = Arc::new(Shard::create(&self.dir.join(&name))?);
            self.spare.lock().shards.push_back((name, shard));
        }

        if needed > 0 {
            debug!(created = needed, "preallocated spare shards");
        }
        Ok(())
    }

    /// Removes every shard file, every spare, and the directory itself.
    /// The struct remains usable only for dropping.
    pub fn destroy(&self) -> Result<(), DiskError> {
        let _mutating = self.mutate.lock();
        let shards = self.shards.write();
        let mut spare = self.spare.lock();
        let mut ret = Ok(());

        for i in 0..shards.len() {
            let name = recovery::shard_filename(&shards.coordinate(i));
            if fs::remove_file(self.dir.join(name)).is_err() {
                ret = Err(DiskError::DropFailed);
            }
        }
        for (name, _) in spare.shards.drain(..) {
            if fs::remove_file(self.dir.join(name)).is_err() {
                ret = Err(DiskError::DropFailed);
            }
        }
        if ret.is_ok() && fs::remove_dir(&self.dir).is_err() {
            ret = Err(DiskError::DropFailed);
        }
        ret
    }

    /// A fresh shard at the canonical filename for `coord`, consuming a
    /// spare by rename when one is pooled.
    pub(crate) fn create_shard(&self, coord: &Coordinate) -> Result<Arc<Shard>, DiskError> {
        self.create_shard_file(&recovery::shard_filename(coord))
    }

    /// A fresh shard at the temporary filename for `coord` (the clean
    /// path's scratch target).
    fn create_tmp_shard(&self, coord: &Coordinate) -> Result<Arc<Shard>, DiskError> {
        self.create_shard_file(&recovery::shard_tmp_filename(coord))
    }

    fn create_shard_file(&self, name: &str) -> Result<Arc<Shard>, DiskError> {
        let spare = self.spare.lock().shards.pop_front();
        if let Some((spare_name, shard)) = spare {
            fs::rename(self.dir.join(&spare_name), self.dir.join(name))?;
            return Ok(shard);
        }
        Ok(Arc::new(Shard::create(&self.dir.join(name))?))
    }

    fn drop_shard(&self, coord: &Coordinate) -> Result<(), DiskError> {
        fs::remove_file(self.dir.join(recovery::shard_filename(coord)))
            .map_err(|_| DiskError::DropFailed)
    }
}

/// The unfixed bit (positions 1..31) whose one/zero counts are closest to
/// balanced; ties break toward the lower position. Falls back to bit 0
/// when every candidate is already fixed.
fn which_to_split(mask: u32, zeros: &[u64; 32], ones: &[u64; 32]) -> u32 {
    let mut best = 0u32;
    let mut best_diff = i64::MAX;
    for bit in 1..32 {
        if mask & (1 << bit) != 0 {
            continue;
        }
        let diff = (ones[bit] as i64 - zeros[bit] as i64).abs();
        if diff < best_diff {
            best = bit as u32;
            best_diff = diff;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::which_to_split;

    #[test]
    fn picks_the_most_balanced_unfixed_bit() {
        let mut zeros = [0u64; 32];
        let mut ones = [0u64; 32];
        zeros[1] = 10;
        ones[1] = 2; // diff 8
        zeros[2] = 5;
        ones[2] = 5; // diff 0 — best
        zeros[3] = 4;
        ones[3] = 5; // diff 1
        assert_eq!(which_to_split(0, &zeros, &ones), 2);
    }

    #[test]
    fn skips_fixed_bits_and_breaks_ties_low() {
        let zeros = [3u64; 32];
        let ones = [3u64; 32];
        // All balanced; lowest unfixed candidate wins.
        assert_eq!(which_to_split(0b0000_0010, &zeros, &ones), 2);
        assert_eq!(which_to_split(0, &zeros, &ones), 1);
    }

    #[test]
    fn falls_back_to_bit_zero_when_saturated() {
        let zeros = [0u64; 32];
        let ones = [0u64; 32];
        assert_eq!(which_to_split(u32::MAX, &zeros, &ones), 0);
    }
}
