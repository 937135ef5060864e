// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod edit;
pub mod set;

pub use edit::VersionEdit;
pub use set::VersionSet;

use crate::{
    key::{lookup_key, InternalKey},
    table_cache::TableCache,
    value::UserValue,
    Config, UserKey,
};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};

/// Globally unique number of an on-disk file
pub type FileId = u64;

/// Metadata of one immutable sorted table file
pub struct FileMetaData {
    pub number: FileId,

    /// File size in bytes
    pub size: u64,

    /// Smallest internal key served by the table
    pub smallest: InternalKey,

    /// Largest internal key served by the table
    pub largest: InternalKey,

    /// Seeks allowed until the file is scheduled for compaction.
    ///
    /// A file that keeps getting probed without answering queries is
    /// merged down so lookups stop paying for it.
    pub(crate) allowed_seeks: AtomicI64,
}

impl std::fmt::Debug for FileMetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} ({} B) [{:?} .. {:?}]",
            self.number, self.size, self.smallest, self.largest,
        )
    }
}

impl FileMetaData {
    #[must_use]
    pub fn new(number: FileId, size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        Self {
            number,
            size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(1 << 30),
        }
    }

    /// Seeds the seek budget:
    ///
    /// One seek costs about 10 ms, and compacting 1 MiB does roughly
    /// 25 MiB of I/O, so one seek is worth about 40 KiB of compaction.
    /// 16 KiB per seek is used to be conservative.
    pub(crate) fn init_allowed_seeks(&self, io_granularity: u64) {
        let seeks = (self.size / io_granularity.max(1)).max(100);
        self.allowed_seeks.store(seeks as i64, Ordering::Release);
    }

    /// Returns `true` once the seek budget is used up.
    pub(crate) fn consume_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::AcqRel) <= 1
    }

    /// Whether the file's user-key range intersects `[begin, end]`.
    #[must_use]
    pub fn overlaps_user_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        if let Some(begin) = begin {
            if &*self.largest.user_key < begin {
                return false;
            }
        }

        if let Some(end) = end {
            if &*self.smallest.user_key > end {
                return false;
            }
        }

        true
    }
}

/// Outcome of a point lookup against a version
#[derive(Debug, Eq, PartialEq)]
pub enum GetOutcome {
    /// Newest visible entry is a regular value
    Found(UserValue),

    /// Newest visible entry is a tombstone
    Deleted,

    /// No file contains a visible entry for the key
    NotFound,
}

/// Which file a lookup had to consult first when it probed
/// more than one file
pub struct GetStats {
    pub seek_file: Arc<FileMetaData>,
    pub seek_file_level: usize,
}

/// An immutable snapshot of which files belong to which level
///
/// Shared by reference: readers, iterators and compactions hold onto
/// a version while the version set moves on. Files referenced by any
/// live version are protected from deletion.
pub struct Version {
    /// Per-level file lists.
    ///
    /// Level 0 is ordered by file number (newest last); all other
    /// levels are ordered by smallest key with disjoint ranges.
    files: Vec<Vec<Arc<FileMetaData>>>,

    /// Level with the worst size pressure, set by `finalize`
    pub(crate) compaction_level: usize,

    /// Pressure score of that level; >= 1.0 means compaction is due
    pub(crate) compaction_score: f64,

    /// File flagged by the seek statistics, if any
    pub(crate) file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    #[must_use]
    pub fn empty(level_count: u8) -> Self {
        Self {
            files: (0..level_count).map(|_| vec![]).collect(),
            compaction_level: 0,
            compaction_score: -1.0,
            file_to_compact: Mutex::new(None),
        }
    }

    pub(crate) fn from_files(files: Vec<Vec<Arc<FileMetaData>>>) -> Self {
        Self {
            files,
            compaction_level: 0,
            compaction_score: -1.0,
            file_to_compact: Mutex::new(None),
        }
    }

    /// Number of levels.
    #[must_use]
    pub fn level_count(&self) -> usize {
        self.files.len()
    }

    /// Files of the given level.
    #[must_use]
    pub fn level_files(&self, level: usize) -> &[Arc<FileMetaData>] {
        self.files.get(level).map_or(&[], Vec::as_slice)
    }

    /// Number of files in the given level.
    #[must_use]
    pub fn num_files(&self, level: usize) -> usize {
        self.level_files(level).len()
    }

    /// Total bytes of the given level.
    #[must_use]
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.level_files(level).iter().map(|f| f.size).sum()
    }

    pub(crate) fn iter_all_files(&self) -> impl Iterator<Item = &Arc<FileMetaData>> {
        self.files.iter().flatten()
    }

    /// Index of the first file in a sorted level whose largest key
    /// is >= the target.
    fn find_file(files: &[Arc<FileMetaData>], target: &InternalKey) -> usize {
        files.partition_point(|f| f.largest < *target)
    }

    /// Collects the files possibly containing the wanted user key,
    /// in the order they must be probed.
    fn candidate_files(&self, lookup: &InternalKey) -> Vec<(usize, Arc<FileMetaData>)> {
        let user_key = &lookup.user_key;
        let mut candidates = vec![];

        // Level 0 files may overlap: newest first
        let mut level0 = self
            .level_files(0)
            .iter()
            .filter(|f| f.overlaps_user_range(Some(user_key.as_ref()), Some(user_key.as_ref())))
            .cloned()
            .collect::<Vec<_>>();
        level0.sort_unstable_by_key(|f| std::cmp::Reverse(f.number));
        candidates.extend(level0.into_iter().map(|f| (0, f)));

        // Deeper levels are disjoint: at most one candidate each
        for level in 1..self.level_count() {
            let files = self.level_files(level);
            let index = Self::find_file(files, lookup);

            if let Some(file) = files.get(index) {
                if &*file.smallest.user_key <= &**user_key {
                    candidates.push((level, file.clone()));
                }
            }
        }

        candidates
    }

    /// Point lookup through the version's files, newest first.
    ///
    /// Also reports which file had to be consulted first whenever more
    /// than one file was probed, so the caller can feed the seek
    /// statistics.
    pub fn get(
        &self,
        table_cache: &TableCache,
        lookup: &InternalKey,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> crate::Result<(GetOutcome, Option<GetStats>)> {
        let mut stats = None;
        let mut first_consulted: Option<(usize, Arc<FileMetaData>)> = None;

        for (level, file) in self.candidate_files(lookup) {
            if let Some((first_level, first_file)) = first_consulted.take() {
                // More than one file had to be consulted
                stats.get_or_insert(GetStats {
                    seek_file: first_file,
                    seek_file_level: first_level,
                });
            } else if stats.is_none() {
                first_consulted = Some((level, file.clone()));
            }

            let table = table_cache.get(file.number, file.size)?;

            if let Some(entry) = table.internal_get(lookup, verify_checksums, fill_cache)? {
                if entry.key.user_key != lookup.user_key {
                    continue;
                }

                let outcome = if entry.key.is_tombstone() {
                    GetOutcome::Deleted
                } else {
                    GetOutcome::Found(entry.value)
                };

                return Ok((outcome, stats));
            }
        }

        Ok((GetOutcome::NotFound, stats))
    }

    /// Charges a seek to the file reported by [`Version::get`].
    ///
    /// Returns `true` if the file's budget ran out and it became the
    /// next seek-compaction target.
    pub fn update_stats(&self, stats: Option<GetStats>) -> bool {
        let Some(stats) = stats else {
            return false;
        };

        if stats.seek_file_level + 1 >= self.level_count() {
            // Files in the deepest level have nowhere to go
            return false;
        }

        if stats.seek_file.consume_seek() {
            #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
            let mut slot = self.file_to_compact.lock().expect("lock is poisoned");

            if slot.is_none() {
                *slot = Some((stats.seek_file, stats.seek_file_level));
                return true;
            }
        }

        false
    }

    /// Sampling hook of the iterator read path.
    ///
    /// If at least two files overlap the key, the first one gets a
    /// seek charged, mirroring what a Get would have paid.
    pub fn record_read_sample(&self, user_key: &[u8]) -> bool {
        // Highest possible internal key for this user key
        let lookup = lookup_key(user_key, crate::value::MAX_SEQNO);

        let mut matches = 0;
        let mut first: Option<(usize, Arc<FileMetaData>)> = None;

        for (level, file) in self.candidate_files(&lookup) {
            matches += 1;

            if first.is_none() {
                first = Some((level, file));
            }

            if matches >= 2 {
                break;
            }
        }

        if matches >= 2 {
            if let Some((level, file)) = first {
                return self.update_stats(Some(GetStats {
                    seek_file: file,
                    seek_file_level: level,
                }));
            }
        }

        false
    }

    /// The seek-compaction target, if one was flagged.
    pub(crate) fn file_to_compact(&self) -> Option<(Arc<FileMetaData>, usize)> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        self.file_to_compact.lock().expect("lock is poisoned").clone()
    }

    /// Whether any file in the level intersects the user-key range.
    #[must_use]
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        if level == 0 {
            return self
                .level_files(0)
                .iter()
                .any(|f| f.overlaps_user_range(smallest_user_key, largest_user_key));
        }

        // Binary search over the disjoint files
        let files = self.level_files(level);

        let index = match smallest_user_key {
            Some(key) => {
                // Highest possible internal key for this user key
                let target = lookup_key(key, crate::value::MAX_SEQNO);
                Self::find_file(files, &target)
            }
            None => 0,
        };

        let Some(file) = files.get(index) else {
            // Past the range of all files
            return false;
        };

        match largest_user_key {
            Some(key) => &*file.smallest.user_key <= key,
            None => true,
        }
    }

    /// Picks the level a freshly flushed memtable should land at.
    ///
    /// The output can be pushed past level 0 if it does not overlap
    /// the next level and does not overlap too much of the one after,
    /// which avoids creating level-0 files just to merge them again.
    #[must_use]
    pub fn pick_level_for_memtable_output(
        &self,
        config: &Config,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
    ) -> usize {
        let mut level = 0;

        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return level;
        }

        let start = InternalKey::new(
            smallest_user_key,
            crate::value::MAX_SEQNO,
            crate::value::VALUE_TYPE_FOR_SEEK,
        );
        let limit = InternalKey::new(largest_user_key, 0, crate::ValueType::Tombstone);

        while level < config.max_mem_compact_level {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                break;
            }

            if level + 2 < self.level_count() {
                let overlaps = self.overlapping_inputs(level + 2, Some(&start), Some(&limit));
                let total: u64 = overlaps.iter().map(|f| f.size).sum();

                if total > config.max_grandparent_overlap() {
                    break;
                }
            }

            level += 1;
        }

        level
    }

    /// Collects all files whose key range intersects `[begin, end]`.
    ///
    /// For level 0 the range is grown to cover every selected file's
    /// full range and the scan restarts, because overlapping files
    /// must be compacted together.
    #[must_use]
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let mut user_begin: Option<UserKey> = begin.map(|k| k.user_key.clone());
        let mut user_end: Option<UserKey> = end.map(|k| k.user_key.clone());

        let mut inputs: Vec<Arc<FileMetaData>> = vec![];
        let mut i = 0;

        while let Some(file) = self.level_files(level).get(i) {
            i += 1;

            let file_start = &file.smallest.user_key;
            let file_limit = &file.largest.user_key;

            if let Some(begin) = &user_begin {
                if file_limit < begin {
                    continue;
                }
            }

            if let Some(end) = &user_end {
                if file_start > end {
                    continue;
                }
            }

            inputs.push(file.clone());

            if level == 0 {
                // Level-0 files may overlap each other: grow the range
                // and restart until the set is closed under overlap
                let mut restart = false;

                if let Some(begin) = &user_begin {
                    if file_start < begin {
                        user_begin = Some(file_start.clone());
                        restart = true;
                    }
                }

                if let Some(end) = &user_end {
                    if file_limit > end {
                        user_end = Some(file_limit.clone());
                        restart = true;
                    }
                }

                if restart {
                    inputs.clear();
                    i = 0;
                }
            }
        }

        inputs
    }

    /// Smallest and largest internal key across the given files.
    pub(crate) fn key_range(files: &[Arc<FileMetaData>]) -> Option<(InternalKey, InternalKey)> {
        let mut smallest: Option<InternalKey> = None;
        let mut largest: Option<InternalKey> = None;

        for file in files {
            match &smallest {
                Some(s) if *s <= file.smallest => {}
                _ => smallest = Some(file.smallest.clone()),
            }

            match &largest {
                Some(l) if *l >= file.largest => {}
                _ => largest = Some(file.largest.clone()),
            }
        }

        Some((smallest?, largest?))
    }

    /// Asserts the level invariants (sorted, disjoint above level 0).
    #[cfg(debug_assertions)]
    pub(crate) fn assert_invariants(&self) {
        for level in 1..self.level_count() {
            let files = self.level_files(level);

            for pair in files.windows(2) {
                assert!(
                    pair[0].smallest < pair[1].smallest,
                    "level {level} not sorted by smallest key",
                );
                assert!(
                    pair[0].largest.user_key < pair[1].smallest.user_key,
                    "level {level} has overlapping files",
                );
            }
        }
    }

    /// Emits one line per level for the info log.
    pub(crate) fn level_summary(&self) -> String {
        let counts = self
            .files
            .iter()
            .map(|files| files.len().to_string())
            .collect::<Vec<_>>();

        format!("files[ {} ]", counts.join(" "))
    }
}
