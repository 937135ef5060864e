// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::DbInner;
use crate::{
    key::InternalKey,
    memtable::Memtable,
    merge::{BoxedIterator, MergeIterator},
    table::TableIter,
    table_cache::TableCache,
    value::{InternalValue, SeqNo},
    version::{FileMetaData, Version},
    KvPair, UserKey, ValueType,
};
use std::{ops::Bound, sync::Arc};

/// Translates user-key bounds into internal-key bounds.
///
/// The smallest internal key of a user key carries the maximum
/// trailer, the largest carries the zero trailer.
fn internal_bounds(
    range: &(Bound<UserKey>, Bound<UserKey>),
) -> (Bound<InternalKey>, Bound<InternalKey>) {
    use crate::value::MAX_SEQNO;

    let lo = match &range.0 {
        Bound::Included(key) => Bound::Included(InternalKey::new(
            key.clone(),
            MAX_SEQNO,
            ValueType::Value,
        )),
        Bound::Excluded(key) => {
            Bound::Excluded(InternalKey::new(key.clone(), 0, ValueType::Tombstone))
        }
        Bound::Unbounded => Bound::Unbounded,
    };

    let hi = match &range.1 {
        Bound::Included(key) => {
            Bound::Included(InternalKey::new(key.clone(), 0, ValueType::Tombstone))
        }
        Bound::Excluded(key) => Bound::Excluded(InternalKey::new(
            key.clone(),
            MAX_SEQNO,
            ValueType::Value,
        )),
        Bound::Unbounded => Bound::Unbounded,
    };

    (lo, hi)
}

/// Owning iterator over a memtable range
///
/// Re-seeks the skiplist after the last yielded key, so it does not
/// borrow the memtable and tolerates concurrent inserts (which a
/// sealed or snapshotted read never observes anyway, thanks to the
/// sequence number filter above it).
pub(crate) struct MemtableRangeIter {
    memtable: Arc<Memtable>,
    lo: Bound<InternalKey>,
    hi: Bound<InternalKey>,
    exhausted: bool,
}

impl MemtableRangeIter {
    pub fn new(memtable: Arc<Memtable>, range: &(Bound<UserKey>, Bound<UserKey>)) -> Self {
        let (lo, hi) = internal_bounds(range);

        Self {
            memtable,
            lo,
            hi,
            exhausted: false,
        }
    }
}

impl Iterator for MemtableRangeIter {
    type Item = InternalValue;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let item = self
            .memtable
            .range((self.lo.clone(), self.hi.clone()))
            .next();

        match item {
            Some(item) => {
                self.lo = Bound::Excluded(item.key.clone());
                Some(item)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

impl DoubleEndedIterator for MemtableRangeIter {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let item = self
            .memtable
            .range((self.lo.clone(), self.hi.clone()))
            .next_back();

        match item {
            Some(item) => {
                self.hi = Bound::Excluded(item.key.clone());
                Some(item)
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }
}

/// Concatenating iterator over the disjoint, sorted files of one level
///
/// Tables are opened lazily through the table cache as the cursor
/// reaches them.
pub(crate) struct LevelIter {
    table_cache: Arc<TableCache>,
    files: Vec<Arc<FileMetaData>>,

    lo_file: usize,
    hi_file: usize,

    front: Option<TableIter>,
    back: Option<TableIter>,

    range: (Bound<UserKey>, Bound<UserKey>),

    verify_checksums: bool,
    fill_cache: bool,

    exhausted: bool,
}

impl LevelIter {
    pub fn new(
        table_cache: Arc<TableCache>,
        files: Vec<Arc<FileMetaData>>,
        range: (Bound<UserKey>, Bound<UserKey>),
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Self {
        let lo_file = match &range.0 {
            Bound::Included(key) => files.partition_point(|f| f.largest.user_key < *key),
            Bound::Excluded(key) => files.partition_point(|f| f.largest.user_key <= *key),
            Bound::Unbounded => 0,
        };

        let hi_file = match &range.1 {
            Bound::Included(key) => files.partition_point(|f| f.smallest.user_key <= *key),
            Bound::Excluded(key) => files.partition_point(|f| f.smallest.user_key < *key),
            Bound::Unbounded => files.len(),
        };

        Self {
            table_cache,
            files,
            lo_file: lo_file.min(hi_file),
            hi_file,
            front: None,
            back: None,
            range,
            verify_checksums,
            fill_cache,
            exhausted: false,
        }
    }

    fn open_table(&self, index: usize) -> crate::Result<TableIter> {
        #[expect(clippy::expect_used, reason = "index is within the window")]
        let file = self.files.get(index).expect("file index out of range");

        let table = self.table_cache.get(file.number, file.size)?;

        Ok(table.range(
            self.range.clone(),
            self.verify_checksums,
            self.fill_cache,
        ))
    }
}

impl Iterator for LevelIter {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            if let Some(front) = &mut self.front {
                if let Some(item) = front.next() {
                    if item.is_err() {
                        self.exhausted = true;
                    }
                    return Some(item);
                }
                self.front = None;
            }

            if self.lo_file < self.hi_file {
                let iter = match self.open_table(self.lo_file) {
                    Ok(iter) => iter,
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                };
                self.lo_file += 1;
                self.front = Some(iter);
                continue;
            }

            if let Some(back) = &mut self.back {
                if let Some(item) = back.next() {
                    if item.is_err() {
                        self.exhausted = true;
                    }
                    return Some(item);
                }
                self.back = None;
            }

            return None;
        }
    }
}

impl DoubleEndedIterator for LevelIter {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            if let Some(back) = &mut self.back {
                if let Some(item) = back.next_back() {
                    if item.is_err() {
                        self.exhausted = true;
                    }
                    return Some(item);
                }
                self.back = None;
            }

            if self.lo_file < self.hi_file {
                self.hi_file -= 1;
                let iter = match self.open_table(self.hi_file) {
                    Ok(iter) => iter,
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                };
                self.back = Some(iter);
                continue;
            }

            if let Some(front) = &mut self.front {
                if let Some(item) = front.next_back() {
                    if item.is_err() {
                        self.exhausted = true;
                    }
                    return Some(item);
                }
                self.front = None;
            }

            return None;
        }
    }
}

/// Bidirectional iterator over the database
///
/// Combines the active and immutable memtables, every level-0 file
/// and one concatenating iterator per deeper level under a k-way
/// merge, filtered down to the newest visible entry per user key.
/// Tombstoned keys are skipped.
pub struct DbIterator {
    inner: MergeIterator<'static>,

    /// Keeps the files of the iterated state alive
    version: Arc<Version>,

    db: Arc<DbInner>,

    /// Bytes iterated since the last read sample
    bytes_until_sample: i64,
}

impl DbIterator {
    pub(crate) fn new(
        db: Arc<DbInner>,
        memtables: (Arc<Memtable>, Option<Arc<Memtable>>),
        version: Arc<Version>,
        seqno: SeqNo,
        range: (Bound<UserKey>, Bound<UserKey>),
        verify_checksums: bool,
        fill_cache: bool,
    ) -> crate::Result<Self> {
        let mut iters: Vec<BoxedIterator<'static>> = vec![];

        let (active, immutable) = memtables;

        iters.push(Box::new(MemtableRangeIter::new(active, &range).map(Ok)));

        if let Some(immutable) = immutable {
            iters.push(Box::new(MemtableRangeIter::new(immutable, &range).map(Ok)));
        }

        // Level-0 files overlap, each one joins the merge on its own
        for file in version.level_files(0) {
            let table = db.table_cache.get(file.number, file.size)?;
            iters.push(Box::new(table.range(
                range.clone(),
                verify_checksums,
                fill_cache,
            )));
        }

        for level in 1..version.level_count() {
            let files = version.level_files(level);
            if files.is_empty() {
                continue;
            }

            iters.push(Box::new(LevelIter::new(
                db.table_cache.clone(),
                files.to_vec(),
                range.clone(),
                verify_checksums,
                fill_cache,
            )));
        }

        let inner = MergeIterator::new(iters)
            .evict_old_versions(true)
            .snapshot_seqno(seqno);

        let bytes_until_sample = db.config.read_bytes_period as i64;

        Ok(Self {
            inner,
            version,
            db,
            bytes_until_sample,
        })
    }

    /// Feeds the seek statistics roughly once per megabyte iterated.
    fn sample(&mut self, item: &InternalValue) {
        self.bytes_until_sample -= (item.key.user_key.len() + item.value.len()) as i64;

        if self.bytes_until_sample <= 0 {
            self.bytes_until_sample = self.db.config.read_bytes_period as i64;

            if self.version.record_read_sample(&item.key.user_key) {
                self.db.schedule_compaction();
            }
        }
    }
}

impl Iterator for DbIterator {
    type Item = crate::Result<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = match self.inner.next()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            self.sample(&item);

            if item.is_tombstone() {
                continue;
            }

            return Some(Ok((item.key.user_key, item.value)));
        }
    }
}

impl DoubleEndedIterator for DbIterator {
    fn next_back(&mut self) -> Option<Self::Item> {
        loop {
            let item = match self.inner.next_back()? {
                Ok(item) => item,
                Err(e) => return Some(Err(e)),
            };

            self.sample(&item);

            if item.is_tombstone() {
                continue;
            }

            return Some(Ok((item.key.user_key, item.value)));
        }
    }
}
