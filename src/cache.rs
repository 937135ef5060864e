// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{table::block::DataBlock, version::FileId};
use quick_cache::{sync::Cache as QuickCache, Equivalent, Weighter};
use std::sync::Arc;

#[derive(Eq, std::hash::Hash, PartialEq)]
struct CacheKey(FileId, u64);

impl Equivalent<CacheKey> for (FileId, u64) {
    fn equivalent(&self, key: &CacheKey) -> bool {
        self.0 == key.0 && self.1 == key.1
    }
}

impl From<(FileId, u64)> for CacheKey {
    fn from((file_id, offset): (FileId, u64)) -> Self {
        Self(file_id, offset)
    }
}

#[derive(Clone)]
struct BlockWeighter;

impl Weighter<CacheKey, Arc<DataBlock>> for BlockWeighter {
    fn weight(&self, _: &CacheKey, block: &Arc<DataBlock>) -> u64 {
        block.size() as u64
    }
}

/// Cache of decoded data blocks, keyed by `(file number, block offset)`
///
/// This speeds up consecutive queries to nearby data, improving
/// read performance for hot data. Entries currently handed out stay
/// alive through their `Arc`, even if evicted concurrently.
pub struct Cache {
    data: QuickCache<CacheKey, Arc<DataBlock>, BlockWeighter, rustc_hash::FxBuildHasher>,

    /// Capacity in bytes
    capacity: u64,
}

impl Cache {
    /// Creates a new block cache with roughly `n` bytes of capacity.
    #[must_use]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        // NOTE: Nothing we can do if it fails
        #[allow(clippy::expect_used)]
        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes)
            .hot_allocation(0.9)
            .estimated_items_capacity(100_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let quick_cache = QuickCache::with_options(
            opts,
            BlockWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data: quick_cache,
            capacity: bytes,
        }
    }

    /// Returns the amount of cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }

    /// Returns the cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the number of cached blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if there are no cached blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[doc(hidden)]
    #[must_use]
    pub fn get_block(&self, file_id: FileId, offset: u64) -> Option<Arc<DataBlock>> {
        self.data.get(&(file_id, offset))
    }

    #[doc(hidden)]
    pub fn insert_block(&self, file_id: FileId, offset: u64, block: Arc<DataBlock>) {
        self.data.insert((file_id, offset).into(), block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{value::InternalValue, ValueType};
    use test_log::test;

    fn block(n: usize) -> Arc<DataBlock> {
        let items = (0..n)
            .map(|i| {
                InternalValue::from_components(
                    format!("{i:03}").into_bytes(),
                    *b"v",
                    0,
                    ValueType::Value,
                )
            })
            .collect::<Vec<_>>();

        let mut builder = crate::table::block_builder::BlockBuilder::new(16);
        for item in &items {
            builder.add(&item.key.encode(), &item.value);
        }

        Arc::new(DataBlock::decode(&builder.finish()).expect("should decode"))
    }

    #[test]
    fn cache_hit_and_miss() {
        let cache = Cache::with_capacity_bytes(1_024 * 1_024);

        assert!(cache.get_block(1, 0).is_none());

        cache.insert_block(1, 0, block(10));

        let cached = cache.get_block(1, 0).expect("should be cached");
        assert_eq!(10, cached.items.len());

        assert!(cache.get_block(1, 4_096).is_none());
        assert!(cache.get_block(2, 0).is_none());
    }

    #[test]
    fn cache_eviction_under_pressure() {
        let cache = Cache::with_capacity_bytes(1_024);

        for i in 0..100 {
            cache.insert_block(i, 0, block(50));
        }

        // Capacity is tiny, so most blocks must have been evicted
        assert!(cache.size() <= 2 * 1_024);
    }
}
