use super::*;
use anyhow::Result;
use hashspace::Coordinate;
use tempfile::tempdir;

fn value_of(parts: &[&[u8]]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.to_vec()).collect()
}

#[test]
fn put_get_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    let value = value_of(&[b"first", b"", b"\x00binary\xff"]);
    assert_eq!(shard.put(0x1111, 0x2222, b"key-a", &value, 42), PutStatus::Success);

    let (got, version) = shard.get(0x1111, b"key-a").expect("present");
    assert_eq!(got, value);
    assert_eq!(version, 42);

    assert!(shard.get(0x1111, b"key-b").is_none());
    assert!(shard.get(0x9999, b"key-a").is_none());
    assert!(shard.fsck());
    Ok(())
}

#[test]
fn empty_key_and_empty_value() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    assert_eq!(shard.put(7, 9, b"", &[], 1), PutStatus::Success);
    let (value, version) = shard.get(7, b"").expect("present");
    assert!(value.is_empty());
    assert_eq!(version, 1);
    Ok(())
}

#[test]
fn overwrite_invalidates_previous_entry() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    shard.put(5, 0, b"k", &value_of(&[b"v1"]), 1);
    let first_offset = shard.log_word(0, 1) as u32;
    shard.put(5, 0, b"k", &value_of(&[b"v2"]), 2);

    let (value, version) = shard.get(5, b"k").expect("present");
    assert_eq!(value, value_of(&[b"v2"]));
    assert_eq!(version, 2);

    // Entry 0 now carries entry 1's offset as its invalidator.
    let word = shard.log_word(0, 1);
    assert_eq!(word as u32, first_offset);
    let invalidator = (word >> 32) as u32;
    assert_eq!(invalidator, shard.log_word(1, 1) as u32);

    assert_eq!(shard.search_entries(), 2);
    assert!(shard.fsck());
    Ok(())
}

#[test]
fn del_tombstones_the_slot_and_reserves_a_watermark() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    shard.put(5, 0, b"k", &value_of(&[b"v"]), 1);
    let (bucket_before, _) = shard.hash_lookup(5, b"k");
    let watermark = shard.data_watermark();

    assert_eq!(shard.del(5, b"k"), DelStatus::Success);
    assert_eq!(shard.data_watermark(), watermark + 8);
    assert!(shard.get(5, b"k").is_none());
    assert_eq!(shard.del(5, b"k"), DelStatus::NotFound);

    // The slot still belongs to the key: a fresh put lands on it again.
    assert_eq!(shard.put(5, 0, b"k", &value_of(&[b"v2"]), 2), PutStatus::Success);
    let (bucket_after, slot) = shard.hash_lookup(5, b"k");
    assert_eq!(bucket_before, bucket_after);
    assert!(((slot >> 32) as u32) < HASH_OFFSET_INVALID);
    assert_eq!(shard.get(5, b"k").expect("present").1, 2);
    assert!(shard.fsck());
    Ok(())
}

#[test]
fn del_missing_key_is_notfound() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;
    assert_eq!(shard.del(3, b"never"), DelStatus::NotFound);
    Ok(())
}

#[test]
fn colliding_hashes_resolve_by_key() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    // Same primary hash, different keys: linear probing keeps both.
    shard.put(77, 1, b"alpha", &value_of(&[b"a"]), 1);
    shard.put(77, 2, b"beta", &value_of(&[b"b"]), 2);

    assert_eq!(shard.get(77, b"alpha").expect("a").0, value_of(&[b"a"]));
    assert_eq!(shard.get(77, b"beta").expect("b").0, value_of(&[b"b"]));
    assert!(shard.fsck());
    Ok(())
}

#[test]
fn datafull_leaves_no_trace() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    let big = vec![vec![0xabu8; 20 << 20]];
    assert_eq!(shard.put(1, 1, b"big", &big, 1), PutStatus::Success);

    let watermark = shard.data_watermark();
    let entries = shard.search_entries();

    let too_big = vec![vec![0xcdu8; 10 << 20]];
    assert_eq!(shard.put(2, 2, b"more", &too_big, 2), PutStatus::DataFull);

    assert_eq!(shard.data_watermark(), watermark);
    assert_eq!(shard.search_entries(), entries);
    assert!(shard.get(2, b"more").is_none());
    assert!(shard.get(1, b"big").is_some());
    Ok(())
}

#[test]
fn searchfull_after_exhausting_the_log() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    for i in 0..SEARCH_INDEX_ENTRIES as u32 {
        let key = i.to_le_bytes();
        assert_eq!(
            shard.put(i, i.rotate_left(16), &key, &value_of(&[b"v"]), 1),
            PutStatus::Success,
            "put {i} failed early"
        );
    }

    let key = u32::MAX.to_le_bytes();
    assert_eq!(
        shard.put(u32::MAX, 0, &key, &value_of(&[b"v"]), 1),
        PutStatus::SearchFull
    );
    Ok(())
}

#[test]
fn stale_space_grows_with_overwrites_and_resets_on_copy() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    let chunk = vec![vec![0x5au8; 64 << 10]];
    for i in 0u32..150 {
        shard.put(i, i, &i.to_le_bytes(), &chunk, 1);
    }
    assert_eq!(shard.stale_space(), 0);
    let used_before = shard.used_space();

    let mut last = 0;
    for i in 0u32..150 {
        shard.put(i, i, &i.to_le_bytes(), &chunk, 2);
        let now = shard.stale_space();
        assert!(now >= last, "stale space went backwards");
        last = now;
    }
    assert!(shard.stale_space() >= 30, "stale {}", shard.stale_space());
    assert!(shard.used_space() > used_before);

    let clean = Shard::create(&dir.path().join("clean"))?;
    shard.copy_to(&Coordinate::everything(), &clean);
    assert_eq!(clean.stale_space(), 0);
    assert!(clean.used_space() < shard.used_space());

    for i in 0u32..150 {
        let (value, version) = clean.get(i, &i.to_le_bytes()).expect("survived");
        assert_eq!(value, chunk);
        assert_eq!(version, 2);
    }
    assert!(clean.fsck());
    Ok(())
}

#[test]
fn copy_to_filters_by_coordinate_in_order() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    // Secondary bit 1 set on the odd entries.
    shard.put(10, 0b00, b"a", &value_of(&[b"va"]), 1);
    shard.put(11, 0b10, b"b", &value_of(&[b"vb"]), 2);
    shard.put(12, 0b00, b"c", &value_of(&[b"vc"]), 3);
    shard.put(13, 0b10, b"d", &value_of(&[b"vd"]), 4);
    // Superseded entries must not be copied.
    shard.put(12, 0b00, b"c", &value_of(&[b"vc2"]), 5);

    let upper = Coordinate::new(0, 0, 0b10, 0b10);
    let dst = Shard::create(&dir.path().join("upper"))?;
    shard.copy_to(&upper, &dst);

    assert!(dst.get(10, b"a").is_none());
    assert_eq!(dst.get(11, b"b").expect("b").0, value_of(&[b"vb"]));
    assert!(dst.get(12, b"c").is_none());
    assert_eq!(dst.get(13, b"d").expect("d").0, value_of(&[b"vd"]));

    // Insertion order of the survivors is preserved.
    let hashes: Vec<u32> = dst.make_snapshot().map(|e| e.primary_hash()).collect();
    assert_eq!(hashes, vec![11, 13]);

    // The filter sees the live version, so "c" lands in the lower half only.
    let lower = Coordinate::new(0, 0, 0b10, 0b00);
    let dst2 = Shard::create(&dir.path().join("lower"))?;
    shard.copy_to(&lower, &dst2);
    assert_eq!(dst2.get(12, b"c").expect("c").0, value_of(&[b"vc2"]));
    assert_eq!(dst2.get(12, b"c").expect("c").1, 5);

    assert!(dst.fsck() && dst2.fsck());
    Ok(())
}

#[test]
fn snapshot_sees_live_entries_only() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    shard.put(1, 100, b"a", &value_of(&[b"v1"]), 10);
    shard.put(2, 200, b"b", &value_of(&[b"v2"]), 20);
    shard.put(1, 100, b"a", &value_of(&[b"v3"]), 30);
    shard.del(2, b"b");

    let entries: Vec<_> = shard
        .make_snapshot()
        .map(|e| (e.primary_hash(), e.secondary_hash(), e.key().to_vec(), e.value(), e.version()))
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0], (1, 100, b"a".to_vec(), value_of(&[b"v3"]), 30));

    // A snapshot is bound to the log length at creation time.
    let mut snap = shard.make_snapshot();
    shard.put(3, 300, b"c", &value_of(&[b"v4"]), 40);
    assert_eq!(snap.next().expect("a").key(), b"a");
    assert!(snap.next().is_none());
    Ok(())
}

#[test]
fn reopen_rebuilds_offsets_from_the_log() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("s");

    let watermark;
    let entries;
    {
        let shard = Shard::create(&path)?;
        shard.put(1, 0, b"a", &value_of(&[b"va"]), 1);
        shard.put(2, 0, b"bb", &value_of(&[b"vb", b"wb"]), 2);
        shard.put(1, 0, b"a", &value_of(&[b"va2"]), 3);
        watermark = shard.data_watermark();
        entries = shard.search_entries();
    }

    let shard = Shard::open(&path)?;
    assert_eq!(shard.data_watermark(), watermark);
    assert_eq!(shard.search_entries(), entries);

    assert_eq!(shard.get(1, b"a").expect("a").0, value_of(&[b"va2"]));
    assert_eq!(shard.get(2, b"bb").expect("b").0, value_of(&[b"vb", b"wb"]));
    assert!(shard.fsck());

    // Appends continue where the log left off.
    assert_eq!(shard.put(3, 0, b"c", &value_of(&[b"vc"]), 4), PutStatus::Success);
    assert_eq!(shard.search_entries(), entries + 1);
    Ok(())
}

#[test]
fn open_rejects_wrong_size() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("s");
    std::fs::write(&path, b"not a shard")?;
    assert!(matches!(Shard::open(&path), Err(ShardError::WrongSize(_))));
    Ok(())
}

#[test]
fn offsets_stay_aligned() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    for i in 0u32..10 {
        // Odd-sized keys and attributes exercise the padding.
        let key = vec![b'k'; 1 + i as usize];
        let value = value_of(&[&vec![b'v'; 3 + i as usize]]);
        shard.put(i, i, &key, &value, i as u64);
        assert_eq!(shard.data_watermark() & 7, 0);
        assert_eq!(shard.log_word(i as usize, 1) as u32 & 7, 0);
    }
    Ok(())
}

#[test]
fn fsck_flags_an_unreferenced_live_entry() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    shard.put(5, 0, b"k", &value_of(&[b"v"]), 1);
    assert!(shard.fsck());

    // Wipe the hash slot out from under the live log entry.
    let (bucket, _) = shard.hash_lookup(5, b"k");
    shard.store_hash_slot(bucket, 0);

    let mut report = String::new();
    assert!(!shard.fsck_report(&mut report));
    assert!(report.contains("not referenced"));
    Ok(())
}

#[test]
fn fsck_flags_garbage_past_the_tail() -> Result<()> {
    let dir = tempdir()?;
    let shard = Shard::create(&dir.path().join("s"))?;

    shard.put(5, 0, b"k", &value_of(&[b"v"]), 1);
    // Non-zero hashes in the zero run.
    shard.store_log_word(3, 0, 0xdead_beef);

    assert!(!shard.fsck());
    Ok(())
}
