// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::file::{INFO_LOG_FILE, OLD_INFO_LOG_FILE};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

/// Append-only, human-readable event log inside the database folder
///
/// Major lifecycle events (recovery, flushes, compactions, background
/// errors) are recorded here and mirrored to the `log` facade.
pub struct InfoLog {
    file: Mutex<Option<File>>,
}

impl InfoLog {
    /// Opens `LOG` in the given folder, rotating a previous one to `LOG.old`.
    pub fn open<P: AsRef<Path>>(folder: P) -> Self {
        let folder = folder.as_ref();
        let path = folder.join(INFO_LOG_FILE);

        if path.exists() {
            // Rotation is best-effort
            let _ = std::fs::rename(&path, folder.join(OLD_INFO_LOG_FILE));
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok();

        Self {
            file: Mutex::new(file),
        }
    }

    /// Creates a logger that only feeds the `log` facade.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    pub fn write(&self, message: &str) {
        log::info!("{message}");

        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut file = self.file.lock().expect("lock is poisoned");

        if let Some(file) = file.as_mut() {
            let micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros())
                .unwrap_or_default();

            // Ignore write errors, the info log is not load-bearing
            let _ = writeln!(file, "{}.{:06} {message}", micros / 1_000_000, micros % 1_000_000);
        }
    }
}
