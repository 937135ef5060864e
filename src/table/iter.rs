// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{block::DataBlock, Table};
use crate::{value::InternalValue, UserKey};
use std::{ops::Bound, sync::Arc};

/// Window into a loaded data block
struct BlockCursor {
    block: Arc<DataBlock>,
    lo: usize,
    hi: usize,
}

impl BlockCursor {
    fn is_empty(&self) -> bool {
        self.lo >= self.hi
    }

    fn pop_front(&mut self) -> Option<InternalValue> {
        if self.is_empty() {
            return None;
        }

        let item = self.block.items.get(self.lo).cloned();
        self.lo += 1;
        item
    }

    fn pop_back(&mut self) -> Option<InternalValue> {
        if self.is_empty() {
            return None;
        }

        self.hi -= 1;
        self.block.items.get(self.hi).cloned()
    }
}

/// Two-level iterator over a table file
///
/// The outer level walks the index block; each index entry yields a
/// data block that is loaded lazily through the block cache. Both
/// iteration directions share one window over the index, so every
/// block is loaded at most once.
pub struct TableIter {
    table: Arc<Table>,

    /// Index entries not yet consumed by either end
    lo_block: usize,
    hi_block: usize,

    front: Option<BlockCursor>,
    back: Option<BlockCursor>,

    range: (Bound<UserKey>, Bound<UserKey>),

    verify_checksums: bool,
    fill_cache: bool,

    /// Set after an I/O error; the iterator is fused afterwards
    exhausted: bool,
}

impl TableIter {
    pub(crate) fn new(
        table: Arc<Table>,
        range: (Bound<UserKey>, Bound<UserKey>),
        verify_checksums: bool,
        fill_cache: bool,
    ) -> Self {
        let index = table.index_items();

        // Blocks before the lower bound can never contain items in range,
        // because a separator is >= every key of its block
        let lo_block = match &range.0 {
            Bound::Included(key) => index.partition_point(|(sep, _)| sep.user_key < *key),
            Bound::Excluded(key) => index.partition_point(|(sep, _)| sep.user_key <= *key),
            Bound::Unbounded => 0,
        };

        // The first block whose separator reaches the upper bound may
        // still contain in-range items; everything after it cannot
        let hi_block = match &range.1 {
            Bound::Included(key) | Bound::Excluded(key) => index
                .partition_point(|(sep, _)| sep.user_key < *key)
                .saturating_add(1)
                .min(index.len()),
            Bound::Unbounded => index.len(),
        };

        Self {
            table,
            lo_block,
            hi_block,
            front: None,
            back: None,
            range,
            verify_checksums,
            fill_cache,
            exhausted: false,
        }
    }

    fn load_block(&self, index: usize) -> crate::Result<BlockCursor> {
        #[expect(clippy::expect_used, reason = "index is within the window")]
        let &(_, handle) = self
            .table
            .index_items()
            .get(index)
            .expect("block index out of range");

        let block = self
            .table
            .read_data_block(handle, self.verify_checksums, self.fill_cache)?;

        // Trim to the requested range once, so both ends can pop freely
        let lo = match &self.range.0 {
            Bound::Included(key) => block.items.partition_point(|item| item.key.user_key < *key),
            Bound::Excluded(key) => block.items.partition_point(|item| item.key.user_key <= *key),
            Bound::Unbounded => 0,
        };

        let hi = match &self.range.1 {
            Bound::Included(key) => block.items.partition_point(|item| item.key.user_key <= *key),
            Bound::Excluded(key) => block.items.partition_point(|item| item.key.user_key < *key),
            Bound::Unbounded => block.items.len(),
        };

        Ok(BlockCursor { block, lo, hi })
    }
}

impl Iterator for TableIter {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            if let Some(front) = &mut self.front {
                if let Some(item) = front.pop_front() {
                    return Some(Ok(item));
                }
                self.front = None;
            }

            if self.lo_block < self.hi_block {
                let cursor = match self.load_block(self.lo_block) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                };
                self.lo_block += 1;
                self.front = Some(cursor);
                continue;
            }

            // Take over whatever the back end has not consumed
            if let Some(back) = &mut self.back {
                if let Some(item) = back.pop_front() {
                    return Some(Ok(item));
                }
                self.back = None;
            }

            return None;
        }
    }
}

impl DoubleEndedIterator for TableIter {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        loop {
            if let Some(back) = &mut self.back {
                if let Some(item) = back.pop_back() {
                    return Some(Ok(item));
                }
                self.back = None;
            }

            if self.lo_block < self.hi_block {
                self.hi_block -= 1;
                let cursor = match self.load_block(self.hi_block) {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                };
                self.back = Some(cursor);
                continue;
            }

            if let Some(front) = &mut self.front {
                if let Some(item) = front.pop_back() {
                    return Some(Ok(item));
                }
                self.front = None;
            }

            return None;
        }
    }
}
