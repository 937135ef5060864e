// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    key::InternalKey,
    version::{FileId, FileMetaData, Version, VersionEdit},
    Config,
};
use std::sync::Arc;

/// A planned merge of files from level L into level L+1
///
/// Holds a reference to the version its inputs were picked from, so
/// the input files cannot be deleted while the compaction runs.
pub struct Compaction {
    pub(crate) level: usize,

    /// Version the inputs belong to
    pub(crate) input_version: Arc<Version>,

    /// The edit that will publish the result
    pub(crate) edit: VersionEdit,

    /// Inputs from level L and level L+1
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],

    /// Files of level L+2 overlapping the compaction range
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    max_output_file_size: u64,
    max_grandparent_overlap: u64,

    // State for `should_stop_before`
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Monotonic per-level cursors for `is_base_level_for_key`;
    // valid because compaction emits user keys in ascending order
    level_ptrs: Vec<usize>,
}

impl Compaction {
    pub(crate) fn new(config: &Config, input_version: Arc<Version>, level: usize) -> Self {
        let level_count = input_version.level_count();

        Self {
            level,
            input_version,
            edit: VersionEdit::default(),
            inputs: [vec![], vec![]],
            grandparents: vec![],
            max_output_file_size: config.target_file_size,
            max_grandparent_overlap: config.max_grandparent_overlap(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: vec![0; level_count],
        }
    }

    /// The level being compacted (outputs land at level + 1).
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }

    /// Input files from `level()` (`which` = 0) or `level() + 1`.
    #[must_use]
    pub fn input(&self, which: usize) -> &[Arc<FileMetaData>] {
        self.inputs.get(which).map_or(&[], Vec::as_slice)
    }

    /// Size threshold at which an output file is cut.
    #[must_use]
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    #[must_use]
    pub(crate) fn take_edit(&mut self) -> VersionEdit {
        std::mem::take(&mut self.edit)
    }

    /// Whether this compaction can be served by re-linking a single
    /// file one level down, without any merging I/O.
    ///
    /// Only allowed when the grandparent overlap stays small; moving
    /// a file down into a heavily overlapped spot would just make the
    /// next compaction of level + 1 more expensive.
    #[must_use]
    pub fn is_trivial_move(&self) -> bool {
        let grandparent_bytes: u64 = self.grandparents.iter().map(|f| f.size).sum();

        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && grandparent_bytes <= self.max_grandparent_overlap
    }

    /// Marks every input file as deleted in the edit.
    pub(crate) fn add_input_deletions(&mut self) {
        let level = self.level;

        for (which, input_level) in [(0, level), (1, level + 1)] {
            for file in &self.inputs[which] {
                self.edit.remove_file(input_level, file.number);
            }
        }
    }

    /// Whether no level below the compaction output contains the key.
    ///
    /// If so, a tombstone for it has nothing left to hide and can be
    /// dropped. User keys must be queried in ascending order.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        for level in (self.level + 2)..self.input_version.level_count() {
            let files = self.input_version.level_files(level);

            let Some(ptr) = self.level_ptrs.get_mut(level) else {
                continue;
            };

            while let Some(file) = files.get(*ptr) {
                if user_key <= &*file.largest.user_key {
                    if user_key >= &*file.smallest.user_key {
                        // Key range of this deeper file contains the key
                        return false;
                    }
                    break;
                }

                // The cursor only ever moves forward
                *ptr += 1;
            }
        }

        true
    }

    /// Whether the current output should be cut before `key`, because
    /// it already overlaps too much of the grandparent level.
    ///
    /// Bounding the overlap bounds the cost of compacting the output
    /// file again later.
    pub fn should_stop_before(&mut self, key: &InternalKey) -> bool {
        while let Some(grandparent) = self.grandparents.get(self.grandparent_index) {
            if *key > grandparent.largest {
                if self.seen_key {
                    self.overlapped_bytes += grandparent.size;
                }
                self.grandparent_index += 1;
            } else {
                break;
            }
        }

        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            // Too much overlap, cut the output here
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }

    /// File numbers of all inputs, for logging.
    pub(crate) fn input_numbers(&self, which: usize) -> Vec<FileId> {
        self.input(which).iter().map(|f| f.number).collect()
    }
}
