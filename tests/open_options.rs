use lsm_kv::{Config, WriteOptions};
use test_log::test;

#[test]
fn open_missing_without_create_fails() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("does-not-exist");

    let result = Config::new(path).create_if_missing(false).open();
    assert!(result.is_err());
}

#[test]
fn open_existing_with_error_if_exists_fails() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let db = Config::new(dir.path()).open()?;
        db.put("a", "1", &WriteOptions::default())?;
    }

    let result = Config::new(dir.path()).error_if_exists(true).open();
    assert!(result.is_err());

    Ok(())
}

#[test]
fn second_open_fails_while_locked() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;

    let _db = Config::new(dir.path()).open()?;

    let result = Config::new(dir.path()).open();
    assert!(result.is_err(), "LOCK must exclude a second instance");

    Ok(())
}

#[test]
fn reopen_after_close_succeeds() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let _db = Config::new(dir.path()).open()?;
    }

    let _db = Config::new(dir.path()).open()?;

    Ok(())
}

#[test]
fn destroy_removes_the_database() -> lsm_kv::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("db");

    {
        let db = Config::new(&path).open()?;
        db.put("a", "1", &WriteOptions::default())?;
    }

    lsm_kv::destroy_db(&path)?;
    assert!(!path.exists());

    // A fresh database can be created in the same spot
    let _db = Config::new(&path).open()?;

    Ok(())
}
