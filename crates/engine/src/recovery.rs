/// Shard filenames and the cold-start path: cleaning up leftovers from an
/// interrupted clean or an unused spare pool, then reloading live shards
/// from their coordinate-encoded names.
use crate::{DiskError, ShardVector};
use hashspace::Coordinate;
use shard::Shard;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Canonical filename for a live shard: the four coordinate fields as
/// 16-hex-digit zero-padded words, dash-separated.
pub(crate) fn shard_filename(c: &Coordinate) -> String {
    format!(
        "{:016x}-{:016x}-{:016x}-{:016x}",
        c.primary_mask, c.primary_hash, c.secondary_mask, c.secondary_hash
    )
}

/// Scratch filename used while cleaning a shard.
pub(crate) fn shard_tmp_filename(c: &Coordinate) -> String {
    format!("{}-tmp", shard_filename(c))
}

/// Inverse of [`shard_filename`]. Temporaries and spares do not parse.
pub(crate) fn parse_shard_filename(name: &str) -> Option<Coordinate> {
    let fields: Vec<&str> = name.split('-').collect();
    if fields.len() != 4 {
        return None;
    }
    let mut values = [0u32; 4];
    for (value, field) in values.iter_mut().zip(&fields) {
        if field.len() != 16 {
            return None;
        }
        let wide = u64::from_str_radix(field, 16).ok()?;
        *value = u32::try_from(wide).ok()?;
    }
    Some(Coordinate::new(values[0], values[1], values[2], values[3]))
}

/// Creates the store directory with owner-only permissions. An existing
/// directory is left as is.
pub(crate) fn create_directory(dir: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    match builder.create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Deletes `-tmp` scratch files and `spare-` pool files left behind by a
/// previous run. Neither holds data a live shard doesn't also hold.
pub(crate) fn remove_leftovers(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with("-tmp") || name.starts_with("spare-") {
            debug!(file = name, "removing leftover file");
            let _ = fs::remove_file(&path);
        }
    }
}

/// Reopens every live shard in the directory, or `None` when there are
/// none (a fresh store).
///
/// Vector order is rebuilt by coordinate specificity, wider coverage
/// first: splits append their (narrower) successors after the shard they
/// replace, so ascending mask population recovers an order in which the
/// back-to-front insert scan meets the narrowest cover first.
pub(crate) fn load_existing_shards(dir: &Path) -> Result<Option<ShardVector>, DiskError> {
    let mut found: Vec<(Coordinate, String)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some(coord) = parse_shard_filename(&name) {
            found.push((coord, name));
        }
    }

    if found.is_empty() {
        return Ok(None);
    }

    found.sort_by_key(|(coord, name)| {
        (
            coord.primary_mask.count_ones() + coord.secondary_mask.count_ones(),
            name.clone(),
        )
    });

    let mut shards = Vec::with_capacity(found.len());
    for (coord, name) in found {
        let shard = Shard::open(&dir.join(&name))?;
        shards.push((coord, Arc::new(shard)));
    }

    info!(shards = shards.len(), "recovered shard directory");
    Ok(Some(ShardVector::from_entries(shards)))
}
