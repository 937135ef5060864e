use lsm_kv::{Config, ReadOptions, WriteOptions};
use test_log::test;

#[test]
fn full_range_compaction_empties_level0() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path())
        .write_buffer_size(256 * 1024)
        .target_file_size(512 * 1024)
        .open()?;

    let write_opts = WriteOptions::default();
    let filler = "v".repeat(1_024);

    // A few MiB across an interleaved key space
    for i in 0..3_000u64 {
        let key_index = (i * 1_031) % 3_000;
        db.put(format!("key{key_index:06}"), &filler, &write_opts)?;
    }

    db.compact_range(None, None)?;
    db.wait_for_background_work()?;

    assert_eq!(
        0,
        db.num_files_at_level(0),
        "level 0 must be empty after full compaction",
    );

    // Level byte budgets hold (with one compaction of slack)
    let budgets = [
        0,
        10 * 1024 * 1024,
        100 * 1024 * 1024,
        1_000 * 1024 * 1024,
    ];
    for (level, budget) in budgets.iter().enumerate().skip(1) {
        let bytes = db.level_bytes(level);
        assert!(
            bytes <= budget + budget / 4,
            "level {level} exceeds budget: {bytes} > {budget}",
        );
    }

    // Correctness is preserved for every key
    let read_opts = ReadOptions::default();
    for i in 0..3_000 {
        assert_eq!(
            Some(filler.clone().into_bytes().into()),
            db.get(format!("key{i:06}"), &read_opts)?,
            "key{i:06} lost during compaction",
        );
    }

    Ok(())
}

#[test]
fn overwrites_and_deletes_are_merged_away() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path())
        .write_buffer_size(64 * 1024)
        .open()?;

    let write_opts = WriteOptions::default();
    let filler = "x".repeat(512);

    for round in 0..5 {
        for i in 0..200 {
            db.put(format!("key{i:04}"), format!("{filler}{round}"), &write_opts)?;
        }
    }

    // Delete every odd key
    for i in (1..200).step_by(2) {
        db.delete(format!("key{i:04}"), &write_opts)?;
    }

    db.compact_range(None, None)?;
    db.wait_for_background_work()?;

    let read_opts = ReadOptions::default();

    for i in 0..200 {
        let value = db.get(format!("key{i:04}"), &read_opts)?;

        if i % 2 == 0 {
            assert_eq!(Some(format!("{filler}4").into_bytes().into()), value);
        } else {
            assert_eq!(None, value, "tombstone for key{i:04} was not honored");
        }
    }

    let live = db.iter(&read_opts)?.collect::<lsm_kv::Result<Vec<_>>>()?;
    assert_eq!(100, live.len());

    Ok(())
}

#[test]
fn partial_range_compaction() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path())
        .write_buffer_size(64 * 1024)
        .open()?;

    let write_opts = WriteOptions::default();
    let filler = "y".repeat(1_024);

    for i in 0..500u64 {
        let key_index = (i * 269) % 500;
        db.put(format!("key{key_index:05}"), &filler, &write_opts)?;
    }

    // Only compact the lower half of the key space
    db.compact_range(Some(b"key00000".as_slice()), Some(b"key00250".as_slice()))?;
    db.wait_for_background_work()?;

    let read_opts = ReadOptions::default();
    for i in 0..500 {
        assert_eq!(
            Some(filler.clone().into_bytes().into()),
            db.get(format!("key{i:05}"), &read_opts)?,
        );
    }

    Ok(())
}
