// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    cache::Cache,
    filter::{BloomPolicy, FilterPolicy},
    CompressionType, Db, Snapshot,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Database configuration builder
#[derive(Clone)]
pub struct Config {
    /// Folder path
    #[doc(hidden)]
    pub path: PathBuf,

    /// Creates the database folder if it does not exist yet
    pub create_if_missing: bool,

    /// Fails `open` if the database already exists
    pub error_if_exists: bool,

    /// Aggressively verify invariants of on-disk data
    pub paranoid_checks: bool,

    /// Size threshold at which the active memtable is sealed and flushed
    pub write_buffer_size: u64,

    /// Maximum number of open table files
    pub max_open_files: usize,

    /// Target uncompressed size of a data block
    pub block_size: u32,

    /// Interval of restart points within a block
    pub block_restart_interval: usize,

    /// What type of compression is used for table blocks
    pub compression: CompressionType,

    /// Amount of levels of the tree (depth of tree)
    pub level_count: u8,

    /// Level-0 file count that starts a size-triggered compaction
    pub l0_compaction_trigger: usize,

    /// Level-0 file count at which writers are slowed down
    pub l0_slowdown_writes_trigger: usize,

    /// Level-0 file count at which writers are stopped
    pub l0_stop_writes_trigger: usize,

    /// Deepest level a flushed memtable may be placed at
    pub max_mem_compact_level: usize,

    /// Target size of a compaction output file
    pub target_file_size: u64,

    /// Byte budget of level 1; each deeper level gets 10x more
    pub level_base_bytes: u64,

    /// Bytes of table data one disk seek is worth, for the
    /// allowed-seeks compaction heuristic
    pub seek_io_granularity: u64,

    /// Bytes of iteration between read samples
    pub read_bytes_period: u64,

    /// Block cache to use
    #[doc(hidden)]
    pub cache: Arc<Cache>,

    /// Filter policy for table files, `None` disables filters
    #[doc(hidden)]
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".kv.data"),
            create_if_missing: true,
            error_if_exists: false,
            paranoid_checks: false,

            write_buffer_size: /* 4 MiB */ 4 * 1_024 * 1_024,
            max_open_files: 1_000,

            block_size: /* 4 KiB */ 4_096,
            block_restart_interval: 16,
            compression: CompressionType::Snappy,

            level_count: 7,
            l0_compaction_trigger: 4,
            l0_slowdown_writes_trigger: 8,
            l0_stop_writes_trigger: 12,
            max_mem_compact_level: 2,

            target_file_size: /* 2 MiB */ 2 * 1_024 * 1_024,
            level_base_bytes: /* 10 MiB */ 10 * 1_024 * 1_024,
            seek_io_granularity: /* 16 KiB */ 16 * 1_024,
            read_bytes_period: /* 1 MiB */ 1_024 * 1_024,

            cache: Arc::new(Cache::with_capacity_bytes(/* 8 MiB */ 8 * 1_024 * 1_024)),
            filter_policy: Some(Arc::new(BloomPolicy::default())),
        }
    }
}

impl Config {
    /// Initializes a new config
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            ..Default::default()
        }
    }

    /// Sets whether a missing database folder is created on open.
    ///
    /// Default = `true`
    #[must_use]
    pub fn create_if_missing(mut self, flag: bool) -> Self {
        self.create_if_missing = flag;
        self
    }

    /// Fails opening if the database already exists.
    ///
    /// Default = `false`
    #[must_use]
    pub fn error_if_exists(mut self, flag: bool) -> Self {
        self.error_if_exists = flag;
        self
    }

    /// Sets the memtable size threshold.
    ///
    /// Default = 4 MiB
    #[must_use]
    pub fn write_buffer_size(mut self, bytes: u64) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    /// Sets the maximum number of cached open table files.
    ///
    /// Default = 1000
    #[must_use]
    pub fn max_open_files(mut self, n: usize) -> Self {
        assert!(n > 0, "need at least one open file");
        self.max_open_files = n;
        self
    }

    /// Sets the target uncompressed data block size.
    ///
    /// Default = 4 KiB
    #[must_use]
    pub fn block_size(mut self, bytes: u32) -> Self {
        assert!(bytes >= 1_024, "block size should be at least 1 KiB");
        self.block_size = bytes;
        self
    }

    /// Sets the compression type for table blocks.
    ///
    /// Default = snappy
    #[must_use]
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the target size of compaction output files.
    ///
    /// Default = 2 MiB
    #[must_use]
    pub fn target_file_size(mut self, bytes: u64) -> Self {
        self.target_file_size = bytes;
        self
    }

    /// Sets the block cache.
    ///
    /// Can be shared between multiple database instances.
    #[must_use]
    pub fn use_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the filter policy, or disables filters entirely.
    ///
    /// Default = 10-bits-per-key bloom filter
    #[must_use]
    pub fn filter_policy(mut self, policy: Option<Arc<dyn FilterPolicy>>) -> Self {
        self.filter_policy = policy;
        self
    }

    /// Limit on grandparent overlap when placing flushed memtables
    /// and cutting compaction outputs.
    #[must_use]
    pub(crate) fn max_grandparent_overlap(&self) -> u64 {
        10 * self.target_file_size
    }

    /// Limit on total input size when growing a compaction.
    #[must_use]
    pub(crate) fn expanded_compaction_limit(&self) -> u64 {
        25 * self.target_file_size
    }

    /// Byte budget of the given level (level 1 and deeper).
    #[must_use]
    pub(crate) fn level_byte_budget(&self, level: usize) -> u64 {
        debug_assert!(level >= 1);

        let mut budget = self.level_base_bytes;

        for _ in 1..level {
            budget = budget.saturating_mul(10);
        }

        budget
    }

    /// Opens the database using the configuration.
    pub fn open(self) -> crate::Result<Db> {
        Db::open(self)
    }
}

/// Options for write operations
#[derive(Copy, Clone, Debug, Default)]
pub struct WriteOptions {
    /// Fsync the write-ahead log before acknowledging the write
    pub sync: bool,
}

/// Options for read operations
#[derive(Clone)]
pub struct ReadOptions {
    /// Verify block checksums on every read
    pub verify_checksums: bool,

    /// Whether blocks read for this query populate the block cache
    pub fill_cache: bool,

    /// Read as of the given snapshot instead of the current state
    pub snapshot: Option<Snapshot>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

impl ReadOptions {
    /// Default read options: checksums unverified, cache filled,
    /// reading the current state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_byte_budgets() {
        let config = Config::default();

        assert_eq!(10 * 1_024 * 1_024, config.level_byte_budget(1));
        assert_eq!(100 * 1_024 * 1_024, config.level_byte_budget(2));
        assert_eq!(1_000 * 1_024 * 1_024, config.level_byte_budget(3));
    }
}
