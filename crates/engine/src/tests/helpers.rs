use crate::{recovery, Disk};
use std::fs;
use std::path::Path;

pub fn open_disk(dir: &Path, arity: u16) -> Disk {
    Disk::open(dir, arity).unwrap()
}

/// Flushes until the write log is fully drained into shards.
pub fn drain(disk: &Disk) {
    while disk.has_pending_writes() {
        disk.flush().unwrap();
    }
}

pub fn value_of(parts: &[&[u8]]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.to_vec()).collect()
}

/// Files in `dir` whose names parse as live shard coordinates.
pub fn count_shard_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| recovery::parse_shard_filename(n).is_some())
                .unwrap_or(false)
        })
        .count()
}

/// Files in `dir` belonging to the spare pool.
pub fn count_spare_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.starts_with("spare-"))
                .unwrap_or(false)
        })
        .count()
}
