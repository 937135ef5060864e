// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{edit::VersionEdit, FileId, FileMetaData, Version};
use crate::{
    coding::{Decode, Encode},
    comparator::{BytewiseComparator, Comparator},
    compaction::Compaction,
    file::{manifest_file_path, read_current_file, set_current_file},
    key::InternalKey,
    wal, Config, HashSet, SeqNo,
};
use std::{
    path::PathBuf,
    sync::{Arc, Weak},
};

/// Creates a brand-new database: an initial manifest plus `CURRENT`.
pub fn create_initial(folder: &std::path::Path) -> crate::Result<()> {
    let mut edit = VersionEdit::default();
    edit.set_comparator_name(BytewiseComparator.name());
    edit.set_log_number(0);
    edit.set_next_file_number(2);
    edit.set_last_sequence(0);

    let manifest_path = manifest_file_path(folder, 1);

    let mut writer = wal::Writer::create(&manifest_path)?;
    writer.add_record(&edit.encode_into_vec())?;
    writer.sync()?;
    drop(writer);

    set_current_file(folder, 1)?;

    Ok(())
}

/// Owns the sequence of versions and the manifest that records it
///
/// All mutation happens under the engine lock; readers only ever see
/// complete, immutable versions.
pub struct VersionSet {
    folder: PathBuf,
    config: Config,

    next_file_number: FileId,
    manifest_file_number: FileId,
    last_sequence: SeqNo,

    /// Number of the write-ahead log currently in use
    pub log_number: FileId,

    /// Log of the previous memtable, still needed until its flush lands
    pub prev_log_number: FileId,

    current: Arc<Version>,

    /// All versions ever installed; pruned lazily.
    ///
    /// Entries that still upgrade are alive (a reader or compaction
    /// holds them) and protect their files from deletion.
    versions: Vec<Weak<Version>>,

    /// Per-level key where the next size compaction should resume
    compact_pointer: Vec<Option<InternalKey>>,

    manifest: Option<wal::Writer>,
}

impl VersionSet {
    #[must_use]
    pub fn new(folder: PathBuf, config: Config) -> Self {
        let level_count = config.level_count as usize;
        let current = Arc::new(Version::empty(config.level_count));

        Self {
            folder,
            config,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            versions: vec![Arc::downgrade(&current)],
            current,
            compact_pointer: vec![None; level_count],
            manifest: None,
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    #[must_use]
    pub fn last_sequence(&self) -> SeqNo {
        self.last_sequence
    }

    pub fn set_last_sequence(&mut self, seqno: SeqNo) {
        debug_assert!(seqno >= self.last_sequence);
        self.last_sequence = seqno;
    }

    /// Allocates a new, globally unique file number.
    pub fn new_file_number(&mut self) -> FileId {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Returns an unused file number to the counter if possible.
    pub fn reuse_file_number(&mut self, number: FileId) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    pub fn mark_file_number_used(&mut self, number: FileId) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    #[must_use]
    pub fn manifest_file_number(&self) -> FileId {
        self.manifest_file_number
    }

    /// File numbers referenced by any live version.
    #[must_use]
    pub fn live_files(&mut self) -> HashSet<FileId> {
        let mut live = HashSet::default();

        self.versions.retain(|weak| {
            let Some(version) = weak.upgrade() else {
                return false;
            };

            for file in version.iter_all_files() {
                live.insert(file.number);
            }

            true
        });

        live
    }

    /// Applies an edit, persists it to the manifest and installs the
    /// resulting version as current.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> crate::Result<()> {
        if let Some(log_number) = edit.log_number {
            debug_assert!(log_number >= self.log_number);
            debug_assert!(log_number < self.next_file_number);
        } else {
            edit.set_log_number(self.log_number);
        }

        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }

        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let version = {
            let mut builder = Builder::new(&self.config, self.current.clone());
            builder.apply(&edit, &mut self.compact_pointer);
            let mut version = builder.save_to()?;
            finalize(&self.config, &mut version);

            #[cfg(debug_assertions)]
            version.assert_invariants();

            Arc::new(version)
        };

        // First edit after recovery starts a fresh manifest with a
        // snapshot of the current state
        let mut created_manifest = false;

        if self.manifest.is_none() {
            let path = manifest_file_path(&self.folder, self.manifest_file_number);
            let mut writer = wal::Writer::create(&path)?;

            self.write_snapshot(&mut writer)?;
            self.manifest = Some(writer);
            created_manifest = true;
        }

        {
            #[expect(clippy::expect_used, reason = "manifest was just ensured above")]
            let writer = self.manifest.as_mut().expect("manifest must be open");

            writer.add_record(&edit.encode_into_vec())?;
            writer.sync()?;
        }

        if created_manifest {
            set_current_file(&self.folder, self.manifest_file_number)?;
        }

        // Install
        self.versions.push(Arc::downgrade(&version));
        self.current = version;

        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        if let Some(n) = edit.prev_log_number {
            self.prev_log_number = n;
        }

        Ok(())
    }

    /// Reconstructs the current version by replaying the manifest
    /// named by `CURRENT`.
    pub fn recover(&mut self) -> crate::Result<()> {
        let manifest_name = read_current_file(&self.folder)?;
        let manifest_path = self.folder.join(&manifest_name);

        let mut reader = wal::Reader::open(&manifest_path)?;

        let mut builder = Builder::new(&self.config, Arc::new(Version::empty(self.config.level_count)));

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        while let Some(record) = reader.read_record()? {
            let edit = VersionEdit::decode_from(&mut std::io::Cursor::new(record))?;

            if let Some(name) = &edit.comparator {
                let expected = BytewiseComparator.name();
                if name != expected {
                    return Err(crate::Error::InvalidArgument(format!(
                        "comparator mismatch: database uses {name}, engine provides {expected}",
                    )));
                }
            }

            builder.apply(&edit, &mut self.compact_pointer);

            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        let next_file_number = next_file_number
            .ok_or_else(|| crate::Error::Corruption("manifest misses next-file-number".into()))?;
        let last_sequence = last_sequence
            .ok_or_else(|| crate::Error::Corruption("manifest misses last-sequence".into()))?;
        let log_number = log_number.unwrap_or(0);
        let prev_log_number = prev_log_number.unwrap_or(0);

        let mut version = builder.save_to()?;
        finalize(&self.config, &mut version);

        let version = Arc::new(version);
        self.versions.push(Arc::downgrade(&version));
        self.current = version;

        self.next_file_number = next_file_number;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        // The next manifest generation replaces the recovered one
        self.manifest_file_number = self.new_file_number();

        Ok(())
    }

    /// Writes the full current state as one edit.
    fn write_snapshot(&self, writer: &mut wal::Writer) -> crate::Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name(BytewiseComparator.name());

        for (level, key) in self.compact_pointer.iter().enumerate() {
            if let Some(key) = key {
                edit.set_compact_pointer(level, key.clone());
            }
        }

        for level in 0..self.current.level_count() {
            for file in self.current.level_files(level) {
                edit.add_file(level, file.clone());
            }
        }

        writer.add_record(&edit.encode_into_vec())?;
        Ok(())
    }

    /// Whether a size- or seek-triggered compaction is due.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.current.compaction_score >= 1.0 || self.current.file_to_compact().is_some()
    }

    /// Picks the most urgent compaction, if any.
    ///
    /// Size-triggered compactions take precedence over seek-triggered
    /// ones.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current.clone();

        let (level, mut inputs) = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            debug_assert!(level + 1 < current.level_count());

            // Resume after the key where the last compaction of this
            // level stopped, wrapping around at the end
            let pointer = self.compact_pointer.get(level).cloned().flatten();

            let file = current
                .level_files(level)
                .iter()
                .find(|f| match &pointer {
                    Some(pointer) => f.largest > *pointer,
                    None => true,
                })
                .or_else(|| current.level_files(level).first())?
                .clone();

            (level, vec![file])
        } else {
            let (file, level) = current.file_to_compact()?;
            (level, vec![file])
        };

        // Level-0 inputs must be closed under overlap
        if level == 0 {
            if let Some((smallest, largest)) = Version::key_range(&inputs) {
                inputs = current.overlapping_inputs(0, Some(&smallest), Some(&largest));
                debug_assert!(!inputs.is_empty());
            }
        }

        let mut compaction = Compaction::new(&self.config, current, level);
        compaction.inputs[0] = inputs;

        self.setup_other_inputs(&mut compaction);

        Some(compaction)
    }

    /// Completes a compaction's input sets: level+1 overlaps, bounded
    /// expansion of the level inputs, and grandparent bookkeeping.
    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let level = c.level;
        let version = c.input_version.clone();

        let Some((smallest, largest)) = Version::key_range(&c.inputs[0]) else {
            return;
        };

        c.inputs[1] = version.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        let Some((mut all_start, mut all_limit)) =
            Version::key_range(&[c.inputs[0].clone(), c.inputs[1].clone()].concat())
        else {
            return;
        };

        // Try growing the level inputs to everything overlapping the
        // union range, as long as the level+1 side stays unchanged and
        // the compaction does not balloon
        if !c.inputs[1].is_empty() {
            let expanded0 = version.overlapping_inputs(level, Some(&all_start), Some(&all_limit));

            let inputs0_size: u64 = c.inputs[0].iter().map(|f| f.size).sum();
            let inputs1_size: u64 = c.inputs[1].iter().map(|f| f.size).sum();
            let expanded0_size: u64 = expanded0.iter().map(|f| f.size).sum();

            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size < self.config.expanded_compaction_limit()
            {
                if let Some((new_start, new_limit)) = Version::key_range(&expanded0) {
                    let expanded1 =
                        version.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));

                    if expanded1.len() == c.inputs[1].len() {
                        log::debug!(
                            "expanding L{level} compaction: {}+{} to {}+{} files ({inputs0_size}+{inputs1_size} to {expanded0_size}+{inputs1_size} bytes)",
                            c.inputs[0].len(),
                            c.inputs[1].len(),
                            expanded0.len(),
                            expanded1.len(),
                        );

                        c.inputs[0] = expanded0;
                        c.inputs[1] = expanded1;

                        all_start = new_start;
                        all_limit = new_limit;
                    }
                }
            }
        }

        // Grandparent overlap bounds where outputs get cut
        if level + 2 < version.level_count() {
            c.grandparents =
                version.overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Future compactions of this level resume past these inputs,
        // stored eagerly so a failed compaction does not retry the
        // same range forever
        if let Some((_, largest)) = Version::key_range(&c.inputs[0]) {
            if let Some(slot) = self.compact_pointer.get_mut(level) {
                *slot = Some(largest.clone());
            }
            c.edit.set_compact_pointer(level, largest);
        }
    }

    /// Builds a compaction covering the given user-key range of a
    /// level, used by manual range compaction.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current.clone();

        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid compacting arbitrarily much of a deep level in one go;
        // the caller loops until the range is exhausted
        if level > 0 {
            let limit = self.config.target_file_size.max(1);
            let mut total = 0;

            for (idx, file) in inputs.iter().enumerate() {
                total += file.size;
                if total >= 25 * limit {
                    inputs.truncate(idx + 1);
                    break;
                }
            }
        }

        let mut compaction = Compaction::new(&self.config, current, level);
        compaction.inputs[0] = inputs;

        self.setup_other_inputs(&mut compaction);

        Some(compaction)
    }
}

/// Computes the level most in need of compaction.
fn finalize(config: &Config, version: &mut Version) {
    let mut best_level = 0;
    let mut best_score = -1.0f64;

    for level in 0..version.level_count().saturating_sub(1) {
        let score = if level == 0 {
            // File count instead of bytes: every level-0 file is
            // consulted by every read, and the files may overlap
            version.num_files(0) as f64 / config.l0_compaction_trigger as f64
        } else {
            version.level_bytes(level) as f64 / config.level_byte_budget(level) as f64
        };

        if score > best_score {
            best_level = level;
            best_score = score;
        }
    }

    version.compaction_level = best_level;
    version.compaction_score = best_score;
}

/// Accumulates edits on top of a base version
///
/// `save_to` merges base files with added files in sorted order,
/// dropping deleted ones.
struct Builder {
    config: Config,
    base: Arc<Version>,

    deleted: Vec<HashSet<FileId>>,
    added: Vec<Vec<Arc<FileMetaData>>>,
}

impl Builder {
    fn new(config: &Config, base: Arc<Version>) -> Self {
        let levels = base.level_count();

        Self {
            config: config.clone(),
            base,
            deleted: (0..levels).map(|_| HashSet::default()).collect(),
            added: (0..levels).map(|_| vec![]).collect(),
        }
    }

    /// Folds one edit into the pending state.
    fn apply(&mut self, edit: &VersionEdit, compact_pointer: &mut [Option<InternalKey>]) {
        for (level, key) in &edit.compact_pointers {
            if let Some(slot) = compact_pointer.get_mut(*level) {
                *slot = Some(key.clone());
            }
        }

        for (level, number) in &edit.deleted_files {
            if let Some(set) = self.deleted.get_mut(*level) {
                set.insert(*number);
            }
        }

        for (level, file) in &edit.new_files {
            file.init_allowed_seeks(self.config.seek_io_granularity);

            if let Some(set) = self.deleted.get_mut(*level) {
                set.remove(&file.number);
            }
            if let Some(files) = self.added.get_mut(*level) {
                files.push(file.clone());
            }
        }
    }

    /// Produces the new version.
    fn save_to(self) -> crate::Result<Version> {
        let mut files: Vec<Vec<Arc<FileMetaData>>> = vec![];

        for level in 0..self.base.level_count() {
            let deleted = self.deleted.get(level);

            let mut merged: Vec<Arc<FileMetaData>> = self
                .base
                .level_files(level)
                .iter()
                .chain(self.added.get(level).map_or(&[] as &[_], Vec::as_slice))
                .filter(|f| !deleted.is_some_and(|d| d.contains(&f.number)))
                .cloned()
                .collect();

            if level == 0 {
                // Level 0 is scanned newest-first; keep the list
                // ordered by file number
                merged.sort_unstable_by_key(|f| f.number);
                merged.dedup_by_key(|f| f.number);
            } else {
                merged.sort_unstable_by(|a, b| {
                    (&a.smallest, a.number).cmp(&(&b.smallest, b.number))
                });

                // Disjointness of the level must survive every edit
                for pair in merged.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);

                    if a.largest.user_key >= b.smallest.user_key {
                        return Err(crate::Error::Corruption(format!(
                            "level {level} files {} and {} overlap",
                            a.number, b.number,
                        )));
                    }
                }
            }

            files.push(merged);
        }

        Ok(Version::from_files(files))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::InternalKey, value::MAX_SEQNO, ValueType};
    use test_log::test;

    fn meta(number: FileId, smallest: &[u8], largest: &[u8]) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            4_096,
            InternalKey::new(smallest, MAX_SEQNO, ValueType::Value),
            InternalKey::new(largest, 0, ValueType::Tombstone),
        ))
    }

    #[test]
    fn manifest_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path());

        create_initial(dir.path())?;

        let (level0_file, kept_file, dropped_file);

        {
            let mut set = VersionSet::new(dir.path().into(), config.clone());
            set.recover()?;

            assert_eq!(0, set.last_sequence());

            level0_file = set.new_file_number();
            dropped_file = set.new_file_number();
            kept_file = set.new_file_number();

            let mut edit = VersionEdit::default();
            edit.add_file(0, meta(level0_file, b"a", b"m"));
            edit.add_file(2, meta(dropped_file, b"a", b"m"));
            edit.add_file(2, meta(kept_file, b"n", b"z"));
            set.set_last_sequence(500);
            set.log_and_apply(edit)?;

            let mut edit = VersionEdit::default();
            edit.remove_file(2, dropped_file);
            set.log_and_apply(edit)?;
        }

        // Replaying the manifest must reproduce the same file sets
        let mut set = VersionSet::new(dir.path().into(), config);
        set.recover()?;

        let current = set.current();
        assert_eq!(500, set.last_sequence());
        assert_eq!(vec![level0_file], numbers(&current, 0));
        assert_eq!(Vec::<FileId>::new(), numbers(&current, 1));
        assert_eq!(vec![kept_file], numbers(&current, 2));

        // File numbers are never reused across opens
        assert!(set.new_file_number() > kept_file);

        Ok(())
    }

    #[test]
    fn builder_rejects_overlap() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path());

        create_initial(dir.path())?;

        let mut set = VersionSet::new(dir.path().into(), config);
        set.recover()?;

        let mut edit = VersionEdit::default();
        edit.add_file(1, meta(10, b"a", b"m"));
        edit.add_file(1, meta(11, b"k", b"z"));

        assert!(set.log_and_apply(edit).is_err());

        Ok(())
    }

    #[test]
    fn size_compaction_picks_worst_level() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::new(dir.path());

        create_initial(dir.path())?;

        let mut set = VersionSet::new(dir.path().into(), config);
        set.recover()?;

        // Four level-0 files trip the file count trigger
        let mut edit = VersionEdit::default();
        for n in 10..14 {
            edit.add_file(0, meta(n, b"a", b"z"));
        }
        edit.add_file(1, meta(20, b"a", b"m"));
        set.log_and_apply(edit)?;

        assert!(set.needs_compaction());

        let compaction = set.pick_compaction().expect("compaction must be due");
        assert_eq!(0, compaction.level());
        assert_eq!(4, compaction.input(0).len(), "L0 inputs closed under overlap");
        assert_eq!(1, compaction.input(1).len());

        Ok(())
    }

    fn numbers(version: &Version, level: usize) -> Vec<FileId> {
        version
            .level_files(level)
            .iter()
            .map(|f| f.number)
            .collect()
    }
}
