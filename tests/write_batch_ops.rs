use lsm_kv::{Config, ReadOptions, WriteBatch, WriteOptions};
use test_log::test;

#[test]
fn batch_is_atomic_and_ordered() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path()).open()?;

    let write_opts = WriteOptions::default();
    let read_opts = ReadOptions::default();

    db.put("b", "will-be-deleted", &write_opts)?;

    let mut batch = WriteBatch::new();
    batch.put("a", "1");
    batch.delete("b");
    batch.put("c", "3");
    batch.put("a", "overwritten-within-batch");

    db.write(batch, &write_opts)?;

    assert_eq!(
        Some("overwritten-within-batch".as_bytes().into()),
        db.get("a", &read_opts)?,
    );
    assert_eq!(None, db.get("b", &read_opts)?);
    assert_eq!(Some("3".as_bytes().into()), db.get("c", &read_opts)?);

    Ok(())
}

#[test]
fn empty_batch_is_a_no_op() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = Config::new(dir.path()).open()?;

    db.write(WriteBatch::new(), &WriteOptions::default())?;

    assert!(db
        .iter(&ReadOptions::default())?
        .collect::<lsm_kv::Result<Vec<_>>>()?
        .is_empty());

    Ok(())
}

#[test]
fn concurrent_writers_coalesce() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let db = std::sync::Arc::new(Config::new(dir.path()).open()?);

    let threads = (0..8)
        .map(|t| {
            let db = db.clone();

            std::thread::spawn(move || -> lsm_kv::Result<()> {
                let write_opts = WriteOptions::default();

                for i in 0..250 {
                    db.put(format!("t{t}-key{i:04}"), format!("value{i}"), &write_opts)?;
                }

                Ok(())
            })
        })
        .collect::<Vec<_>>();

    for handle in threads {
        handle.join().expect("writer thread panicked")?;
    }

    let read_opts = ReadOptions::default();

    for t in 0..8 {
        for i in 0..250 {
            assert_eq!(
                Some(format!("value{i}").into_bytes().into()),
                db.get(format!("t{t}-key{i:04}"), &read_opts)?,
            );
        }
    }

    let count = db.iter(&read_opts)?.count();
    assert_eq!(8 * 250, count);

    Ok(())
}
