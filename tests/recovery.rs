use lsm_kv::{Config, ReadOptions, WriteOptions};
use test_log::test;

#[test]
fn reopen_replays_write_ahead_log() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let db = Config::new(dir.path()).open()?;
        let write_opts = WriteOptions::default();

        for i in 0..1_000 {
            db.put(format!("key{i:05}"), format!("value{i:05}"), &write_opts)?;
        }

        // No sync, no flush: all data only lives in the log
    }

    let db = Config::new(dir.path()).open()?;
    let read_opts = ReadOptions::default();

    for i in 0..1_000 {
        assert_eq!(
            Some(format!("value{i:05}").into_bytes().into()),
            db.get(format!("key{i:05}"), &read_opts)?,
            "key{i:05} lost across reopen",
        );
    }

    Ok(())
}

#[test]
fn reopen_preserves_deletes_and_overwrites() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let db = Config::new(dir.path()).open()?;
        let write_opts = WriteOptions::default();

        db.put("kept", "old", &write_opts)?;
        db.put("kept", "new", &write_opts)?;
        db.put("gone", "x", &write_opts)?;
        db.delete("gone", &write_opts)?;
    }

    let db = Config::new(dir.path()).open()?;
    let read_opts = ReadOptions::default();

    assert_eq!(Some("new".as_bytes().into()), db.get("kept", &read_opts)?);
    assert_eq!(None, db.get("gone", &read_opts)?);

    Ok(())
}

#[test]
fn reopen_after_flushes_and_compaction() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let filler = "z".repeat(1_024);

    {
        let db = Config::new(dir.path())
            .write_buffer_size(64 * 1024)
            .open()?;
        let write_opts = WriteOptions::default();

        for i in 0..500u64 {
            let key_index = (i * 269) % 500;
            db.put(format!("key{key_index:05}"), &filler, &write_opts)?;
        }

        db.compact_range(None, None)?;
        db.wait_for_background_work()?;
    }

    let db = Config::new(dir.path()).open()?;
    let read_opts = ReadOptions::default();

    for i in 0..500 {
        assert_eq!(
            Some(filler.clone().into_bytes().into()),
            db.get(format!("key{i:05}"), &read_opts)?,
        );
    }

    Ok(())
}

#[test]
fn truncated_log_tail_is_tolerated() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let db = Config::new(dir.path()).open()?;
        let write_opts = WriteOptions::default();

        for i in 0..100 {
            db.put(format!("key{i:03}"), format!("value{i:03}"), &write_opts)?;
        }
    }

    // Chop one byte off the newest log file, cutting into the last record
    let mut logs: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            name.ends_with(".log").then(|| entry.path())
        })
        .collect();
    logs.sort();

    let newest = logs.last().expect("a log file must exist");
    let len = std::fs::metadata(newest)?.len();
    assert!(len > 0, "log must not be empty");

    let file = std::fs::OpenOptions::new().write(true).open(newest)?;
    file.set_len(len - 1)?;
    drop(file);

    // Open succeeds; everything before the mangled record survives
    let db = Config::new(dir.path()).open()?;
    let read_opts = ReadOptions::default();

    for i in 0..99 {
        assert_eq!(
            Some(format!("value{i:03}").into_bytes().into()),
            db.get(format!("key{i:03}"), &read_opts)?,
            "key{i:03} should have survived the truncated tail",
        );
    }

    // The very last write sat in the truncated record
    assert_eq!(None, db.get("key099", &read_opts)?);

    Ok(())
}

#[test]
fn file_numbers_are_not_reused_across_opens() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;

    let table_numbers = |path: &std::path::Path| -> std::io::Result<Vec<String>> {
        let mut numbers: Vec<String> = std::fs::read_dir(path)?
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().into_owned();
                name.ends_with(".ldb").then_some(name)
            })
            .collect();
        numbers.sort();
        Ok(numbers)
    };

    {
        let db = Config::new(dir.path())
            .write_buffer_size(64 * 1024)
            .open()?;
        let write_opts = WriteOptions::default();
        let filler = "f".repeat(1_024);

        for i in 0..200 {
            db.put(format!("key{i:04}"), &filler, &write_opts)?;
        }

        db.wait_for_background_work()?;
    }

    let before = table_numbers(dir.path())?;

    {
        let db = Config::new(dir.path())
            .write_buffer_size(64 * 1024)
            .open()?;
        let write_opts = WriteOptions::default();
        let filler = "g".repeat(1_024);

        for i in 200..400 {
            db.put(format!("key{i:04}"), &filler, &write_opts)?;
        }

        db.wait_for_background_work()?;
    }

    let after = table_numbers(dir.path())?;

    // Every pre-existing table that is still around kept its name;
    // new tables got strictly newer numbers
    for name in &before {
        if let Some(max_after) = after.last() {
            assert!(name <= max_after, "file numbers went backwards");
        }
    }

    Ok(())
}
