// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::filter::FilterPolicy;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::sync::Arc;

/// Every filter covers 2 KiB of data block offsets.
const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Builds the filter meta block of a table
///
/// One filter is generated per 2 KiB window of data block offsets, so
/// a reader can map a block handle to its filter without an index:
///
/// ```text
/// [ filter 0 ][ filter 1 ] ...
/// [ offset of filter 0 u32 LE ][ offset of filter 1 ] ...
/// [ offset of offset array u32 LE ][ base lg u8 ]
/// ```
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,

    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    #[must_use]
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: vec![],
            result: vec![],
            filter_offsets: vec![],
        }
    }

    /// Signals that a new data block starts at the given file offset.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);

        while (self.filter_offsets.len() as u64) < filter_index {
            self.generate_filter();
        }
    }

    /// Registers a key of the current data block.
    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);

        if self.keys.is_empty() {
            // An empty filter stands in for ranges without keys
            return;
        }

        let filter = self.policy.create_filter(&self.keys);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
    }

    /// Finishes the block, returning its payload.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }

        let array_offset = self.result.len() as u32;

        #[expect(clippy::expect_used, reason = "writing to a vec cannot fail")]
        {
            for offset in &self.filter_offsets {
                self.result
                    .write_u32::<LittleEndian>(*offset)
                    .expect("cannot fail");
            }

            self.result
                .write_u32::<LittleEndian>(array_offset)
                .expect("cannot fail");
            self.result.write_u8(FILTER_BASE_LG).expect("cannot fail");
        }

        self.result
    }
}

/// Queries the filter meta block of a table
pub struct FilterBlockReader {
    data: Vec<u8>,

    /// Byte offset of the offset array
    array_offset: usize,

    /// Number of filters
    count: usize,

    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(data: Vec<u8>) -> crate::Result<Self> {
        if data.len() < 5 {
            return Err(crate::Error::Corruption("filter block too short".into()));
        }

        #[allow(clippy::indexing_slicing)]
        let base_lg = data[data.len() - 1];

        #[allow(clippy::indexing_slicing)]
        let array_offset = LittleEndian::read_u32(&data[data.len() - 5..]) as usize;

        if array_offset > data.len() - 5 {
            return Err(crate::Error::Corruption(
                "filter offset array out of range".into(),
            ));
        }

        let count = (data.len() - 5 - array_offset) / 4;

        Ok(Self {
            data,
            array_offset,
            count,
            base_lg,
        })
    }

    /// Returns `false` if the key is definitely absent from the data
    /// block starting at `block_offset`.
    #[must_use]
    pub fn key_may_match(&self, policy: &dyn FilterPolicy, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;

        if index >= self.count {
            // Out of range is treated as a potential match
            return true;
        }

        #[allow(clippy::indexing_slicing)]
        let start = LittleEndian::read_u32(&self.data[self.array_offset + index * 4..]) as usize;

        let end = if index + 1 < self.count {
            #[allow(clippy::indexing_slicing)]
            {
                LittleEndian::read_u32(&self.data[self.array_offset + (index + 1) * 4..]) as usize
            }
        } else {
            self.array_offset
        };

        if start == end {
            // Empty filter covering no keys
            return false;
        }

        let Some(filter) = self.data.get(start..end) else {
            return true;
        };

        policy.key_may_match(key, filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BloomPolicy;
    use test_log::test;

    #[test]
    fn filter_block_roundtrip() -> crate::Result<()> {
        let policy = BloomPolicy::default();

        let mut builder = FilterBlockBuilder::new(Arc::new(BloomPolicy::default()));
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        builder.start_block(5_000);
        builder.add_key(b"box");
        builder.start_block(10_000);
        builder.add_key(b"hello");

        let reader = FilterBlockReader::new(builder.finish())?;

        assert!(reader.key_may_match(&policy, 0, b"foo"));
        assert!(reader.key_may_match(&policy, 0, b"bar"));
        assert!(reader.key_may_match(&policy, 5_000, b"box"));
        assert!(reader.key_may_match(&policy, 10_000, b"hello"));

        assert!(!reader.key_may_match(&policy, 0, b"missing"));
        assert!(!reader.key_may_match(&policy, 5_000, b"foo"));

        Ok(())
    }

    #[test]
    fn filter_block_empty_ranges() -> crate::Result<()> {
        let policy = BloomPolicy::default();

        let mut builder = FilterBlockBuilder::new(Arc::new(BloomPolicy::default()));
        builder.start_block(0);
        builder.add_key(b"a");
        // Blocks span a wide offset range with no keys in between
        builder.start_block(9 * 2_048);
        builder.add_key(b"z");

        let reader = FilterBlockReader::new(builder.finish())?;

        assert!(reader.key_may_match(&policy, 0, b"a"));
        assert!(reader.key_may_match(&policy, 9 * 2_048, b"z"));

        // Windows in between hold no keys at all
        assert!(!reader.key_may_match(&policy, 4 * 2_048, b"a"));

        Ok(())
    }
}
