use lsm_kv::{Config, ReadOptions, WriteOptions};
use test_log::test;

#[test]
fn small_write_buffer_spills_to_tables() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path())
        .write_buffer_size(64 * 1024)
        .open()?;

    let write_opts = WriteOptions::default();
    let filler = "v".repeat(1_024);

    // Interleave the key space so consecutive flushes overlap and
    // cannot all be pushed past level 0
    for i in 0..200u64 {
        let key_index = (i * 73) % 200;
        db.put(format!("key{key_index:05}"), &filler, &write_opts)?;
    }

    db.wait_for_background_work()?;

    let total_files: usize = (0..7).map(|level| db.num_files_at_level(level)).sum();
    assert!(total_files >= 1, "memtables must have been flushed");
    assert!(
        db.num_files_at_level(0) >= 1,
        "overlapping flushes must land in level 0",
    );

    // Every key is still readable after the spill
    let read_opts = ReadOptions::default();
    for i in 0..200 {
        assert_eq!(
            Some(filler.clone().into_bytes().into()),
            db.get(format!("key{i:05}"), &read_opts)?,
            "key{i:05} lost during flush",
        );
    }

    Ok(())
}

#[test]
fn data_larger_than_write_buffer_is_fully_readable() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path())
        .write_buffer_size(128 * 1024)
        .open()?;

    let write_opts = WriteOptions::default();

    for i in 0..2_000u64 {
        db.put(format!("key{i:06}"), format!("value{i:06}"), &write_opts)?;
    }

    db.wait_for_background_work()?;

    let read_opts = ReadOptions::default();
    for i in 0..2_000u64 {
        assert_eq!(
            Some(format!("value{i:06}").into_bytes().into()),
            db.get(format!("key{i:06}"), &read_opts)?,
        );
    }

    // Iteration sees every key exactly once, in order
    let items = db.iter(&read_opts)?.collect::<lsm_kv::Result<Vec<_>>>()?;
    assert_eq!(2_000, items.len());
    assert!(items.windows(2).all(|pair| pair[0].0 < pair[1].0));

    Ok(())
}
