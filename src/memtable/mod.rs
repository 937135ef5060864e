// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    key::{lookup_key, InternalKey},
    value::{InternalValue, SeqNo, UserValue},
};
use crossbeam_skiplist::SkipMap;
use std::ops::RangeBounds;
use std::sync::atomic::AtomicU64;

/// The memtable serves as an intermediary, ephemeral, sorted storage for new items
///
/// When the memtable exceeds some size, it is sealed, then flushed
/// to a level-0 table by a background task.
pub struct Memtable {
    /// The actual content, stored in a lock-free skiplist.
    #[doc(hidden)]
    pub items: SkipMap<InternalKey, UserValue>,

    /// Approximate active memtable size.
    ///
    /// If this grows too large, a flush is triggered.
    approximate_size: AtomicU64,
}

/// Outcome of a memtable point lookup
#[derive(Debug, Eq, PartialEq)]
pub enum MemtableGet {
    /// Newest visible entry is a regular value
    Found(UserValue),

    /// Newest visible entry is a tombstone
    Deleted,

    /// The key has no visible entry in this memtable
    NotFound,
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

impl Memtable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: SkipMap::new(),
            approximate_size: AtomicU64::default(),
        }
    }

    /// Creates an iterator over all items.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = InternalValue> + '_ {
        self.items.iter().map(|entry| InternalValue {
            key: entry.key().clone(),
            value: entry.value().clone(),
        })
    }

    /// Creates an iterator over a range of items.
    pub fn range<'a, R: RangeBounds<InternalKey> + 'a>(
        &'a self,
        range: R,
    ) -> impl DoubleEndedIterator<Item = InternalValue> + 'a {
        self.items.range(range).map(|entry| InternalValue {
            key: entry.key().clone(),
            value: entry.value().clone(),
        })
    }

    /// Looks up the newest entry of `key` visible at `seqno`.
    ///
    /// Internal keys are sorted by user key, then by descending sequence
    /// number, so the first entry at or after the lookup key that still
    /// carries the wanted user key is the winner.
    pub fn get(&self, key: &[u8], seqno: SeqNo) -> MemtableGet {
        let lower_bound = lookup_key(key, seqno);

        let mut iter = self
            .items
            .range(lower_bound..)
            .take_while(|entry| &*entry.key().user_key == key);

        match iter.next() {
            Some(entry) if entry.key().is_tombstone() => MemtableGet::Deleted,
            Some(entry) => MemtableGet::Found(entry.value().clone()),
            None => MemtableGet::NotFound,
        }
    }

    /// Gets approximate size of memtable in bytes.
    pub fn size(&self) -> u64 {
        self.approximate_size
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Counts the number of items in the memtable.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the memtable is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts an item into the memtable.
    ///
    /// Items are never updated in place; a newer sequence number
    /// shadows older entries of the same user key.
    pub fn insert(&self, item: InternalValue) {
        #[expect(
            clippy::expect_used,
            reason = "keys are limited to 16-bit length + values are limited to 32-bit length"
        )]
        let item_size: u64 = item.size().try_into().expect("should fit into u64");

        self.approximate_size
            .fetch_add(item_size, std::sync::atomic::Ordering::AcqRel);

        self.items.insert(item.key, item.value);
    }
}
