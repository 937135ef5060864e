// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::version::FileId;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

pub const CURRENT_FILE: &str = "CURRENT";
pub const LOCK_FILE: &str = "LOCK";
pub const INFO_LOG_FILE: &str = "LOG";
pub const OLD_INFO_LOG_FILE: &str = "LOG.old";

pub const TABLE_EXT: &str = "ldb";
pub const LOG_EXT: &str = "log";
pub const TEMP_EXT: &str = "dbtmp";

/// The kinds of files living in a database folder
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    Log,
    Lock,
    Table,
    Manifest,
    Current,
    Temp,
    InfoLog,
}

pub fn log_file_path<P: AsRef<Path>>(folder: P, number: FileId) -> PathBuf {
    folder.as_ref().join(format!("{number:06}.{LOG_EXT}"))
}

pub fn table_file_path<P: AsRef<Path>>(folder: P, number: FileId) -> PathBuf {
    folder.as_ref().join(format!("{number:06}.{TABLE_EXT}"))
}

pub fn temp_file_path<P: AsRef<Path>>(folder: P, number: FileId) -> PathBuf {
    folder.as_ref().join(format!("{number:06}.{TEMP_EXT}"))
}

pub fn manifest_file_path<P: AsRef<Path>>(folder: P, number: FileId) -> PathBuf {
    folder.as_ref().join(format!("MANIFEST-{number:06}"))
}

/// Parses a file name into its type and number.
///
/// Returns `None` for foreign files, which the engine leaves alone.
pub fn parse_file_name(name: &str) -> Option<(FileType, FileId)> {
    match name {
        CURRENT_FILE => return Some((FileType::Current, 0)),
        LOCK_FILE => return Some((FileType::Lock, 0)),
        INFO_LOG_FILE | OLD_INFO_LOG_FILE => return Some((FileType::InfoLog, 0)),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse().ok()?;
        return Some((FileType::Manifest, number));
    }

    let (stem, ext) = name.split_once('.')?;
    let number = stem.parse().ok()?;

    match ext {
        LOG_EXT => Some((FileType::Log, number)),
        TABLE_EXT => Some((FileType::Table, number)),
        TEMP_EXT => Some((FileType::Temp, number)),
        _ => None,
    }
}

/// Points `CURRENT` at the given manifest, using a temporary file
/// plus atomic rename.
pub fn set_current_file<P: AsRef<Path>>(folder: P, manifest_number: FileId) -> crate::Result<()> {
    let folder = folder.as_ref();
    let content = format!("MANIFEST-{manifest_number:06}\n");

    let tmp_path = temp_file_path(folder, manifest_number);

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, folder.join(CURRENT_FILE))?;
    fsync_directory(folder)?;

    Ok(())
}

/// Reads `CURRENT`, returning the name of the active manifest.
pub fn read_current_file<P: AsRef<Path>>(folder: P) -> crate::Result<String> {
    let content = std::fs::read_to_string(folder.as_ref().join(CURRENT_FILE))?;

    let Some(name) = content.strip_suffix('\n') else {
        return Err(crate::Error::Corruption(
            "CURRENT does not end with newline".into(),
        ));
    };

    if name.is_empty() {
        return Err(crate::Error::Corruption("CURRENT is empty".into()));
    }

    Ok(name.to_owned())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory(path: &Path) -> std::io::Result<()> {
    // Cannot fsync directory on Windows
    Ok(())
}

/// Advisory lock on the database folder
///
/// Held for the lifetime of a database handle; a second open of the
/// same folder fails while the lock is alive.
pub struct DbLock {
    _file: File,
}

impl DbLock {
    pub fn acquire<P: AsRef<Path>>(folder: P) -> crate::Result<Self> {
        let path = folder.as_ref().join(LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        Self::try_lock(&file)?;

        Ok(Self { _file: file })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> crate::Result<()> {
        use std::os::unix::io::AsRawFd;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

        if result == 0 {
            Ok(())
        } else {
            Err(crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "database is locked by another handle",
            )))
        }
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn file_name_roundtrip() {
        assert_eq!(Some((FileType::Current, 0)), parse_file_name("CURRENT"));
        assert_eq!(Some((FileType::Lock, 0)), parse_file_name("LOCK"));
        assert_eq!(Some((FileType::InfoLog, 0)), parse_file_name("LOG"));
        assert_eq!(Some((FileType::InfoLog, 0)), parse_file_name("LOG.old"));
        assert_eq!(Some((FileType::Log, 7)), parse_file_name("000007.log"));
        assert_eq!(Some((FileType::Table, 123)), parse_file_name("000123.ldb"));
        assert_eq!(Some((FileType::Temp, 5)), parse_file_name("000005.dbtmp"));
        assert_eq!(
            Some((FileType::Manifest, 42)),
            parse_file_name("MANIFEST-000042"),
        );

        assert_eq!(None, parse_file_name("foo.bar"));
        assert_eq!(None, parse_file_name("MANIFEST-abc"));
        assert_eq!(None, parse_file_name("x.ldb"));
    }

    #[test]
    fn current_file_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        set_current_file(dir.path(), 9)?;
        assert_eq!("MANIFEST-000009", read_current_file(dir.path())?);

        // Temp file must be gone after the swap
        assert!(!temp_file_path(dir.path(), 9).exists());

        Ok(())
    }

    #[test]
    fn lock_excludes_second_holder() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let _lock = DbLock::acquire(dir.path())?;
        assert!(DbLock::acquire(dir.path()).is_err());

        Ok(())
    }
}
