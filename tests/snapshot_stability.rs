use lsm_kv::{Config, ReadOptions, WriteOptions};
use test_log::test;

#[test]
fn snapshot_pins_old_value() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path()).open()?;

    let write_opts = WriteOptions::default();
    let read_opts = ReadOptions::default();

    db.put("x", "1", &write_opts)?;

    let snapshot = db.snapshot();

    db.put("x", "2", &write_opts)?;

    assert_eq!(Some("2".as_bytes().into()), db.get("x", &read_opts)?);

    let mut pinned_opts = ReadOptions::default();
    pinned_opts.snapshot = Some(snapshot);
    assert_eq!(Some("1".as_bytes().into()), db.get("x", &pinned_opts)?);

    // Dropping the options releases the snapshot
    drop(pinned_opts);
    assert_eq!(Some("2".as_bytes().into()), db.get("x", &read_opts)?);

    Ok(())
}

#[test]
fn snapshot_hides_later_writes_and_deletes() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path()).open()?;

    let write_opts = WriteOptions::default();

    db.put("a", "old", &write_opts)?;
    db.put("b", "old", &write_opts)?;

    let snapshot = db.snapshot();

    db.delete("a", &write_opts)?;
    db.put("b", "new", &write_opts)?;
    db.put("c", "new", &write_opts)?;

    let mut pinned_opts = ReadOptions::default();
    pinned_opts.snapshot = Some(snapshot);

    assert_eq!(Some("old".as_bytes().into()), db.get("a", &pinned_opts)?);
    assert_eq!(Some("old".as_bytes().into()), db.get("b", &pinned_opts)?);
    assert_eq!(None, db.get("c", &pinned_opts)?);

    let pinned = db
        .iter(&pinned_opts)?
        .collect::<lsm_kv::Result<Vec<_>>>()?;

    assert_eq!(2, pinned.len());
    assert_eq!(b"a", &*pinned[0].0);
    assert_eq!(b"b", &*pinned[1].0);

    Ok(())
}

#[test]
fn snapshot_survives_flush_and_compaction() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path())
        .write_buffer_size(64 * 1024)
        .open()?;

    let write_opts = WriteOptions::default();

    db.put("stable", "before", &write_opts)?;
    let snapshot = db.snapshot();

    // Overwrite heavily, forcing flushes
    let filler = "x".repeat(1_024);
    for i in 0..300 {
        db.put(format!("key{i:05}"), &filler, &write_opts)?;
        db.put("stable", format!("after{i}"), &write_opts)?;
    }

    db.compact_range(None, None)?;
    db.wait_for_background_work()?;

    let mut pinned_opts = ReadOptions::default();
    pinned_opts.snapshot = Some(snapshot);

    assert_eq!(
        Some("before".as_bytes().into()),
        db.get("stable", &pinned_opts)?,
        "snapshot must survive flush + compaction",
    );

    assert_eq!(
        Some("after299".as_bytes().into()),
        db.get("stable", &ReadOptions::default())?,
    );

    Ok(())
}
