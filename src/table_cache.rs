// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{file::table_file_path, table::Table, version::FileId, Config};
use quick_cache::{sync::Cache as QuickCache, UnitWeighter};
use std::{path::PathBuf, sync::Arc};

/// Caches open table files, keyed by file number
///
/// Bounds the number of simultaneously open file descriptors and
/// keeps parsed footers, index and filter blocks around between
/// reads. Evicting a file number on deletion is mandatory, so the
/// descriptor is closed before the file is unlinked.
pub struct TableCache {
    folder: PathBuf,
    config: Config,

    inner: QuickCache<FileId, Arc<Table>, UnitWeighter, rustc_hash::FxBuildHasher>,
}

impl TableCache {
    #[must_use]
    pub fn new(folder: PathBuf, config: Config) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::default_trait_access)]
        let inner = QuickCache::with(
            config.max_open_files,
            config.max_open_files as u64,
            UnitWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            folder,
            config,
            inner,
        }
    }

    /// Returns the opened table, reading its footer on first access.
    pub fn get(&self, number: FileId, file_size: u64) -> crate::Result<Arc<Table>> {
        if let Some(table) = self.inner.get(&number) {
            return Ok(table);
        }

        let path = table_file_path(&self.folder, number);
        let file = std::fs::File::open(&path)?;

        let table = Arc::new(Table::open(file, number, file_size, &self.config)?);
        self.inner.insert(number, table.clone());

        Ok(table)
    }

    /// Drops the cached descriptor of a deleted table file.
    pub fn evict(&self, number: FileId) {
        self.inner.remove(&number);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
