// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    block::BLOCK_TRAILER_SIZE,
    block_builder::BlockBuilder,
    filter_block::FilterBlockBuilder,
    footer::{BlockHandle, Footer, FOOTER_SIZE},
};
use crate::{
    checksum,
    coding::Encode,
    comparator::{separator, successor, BytewiseComparator},
    compression::{compress, CompressionType},
    key::InternalKey,
    value::InternalValue,
    Config,
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
};

/// Streams sorted entries into an immutable table file
///
/// Entries must be added in ascending internal-key order. The
/// resulting file is:
///
/// ```text
/// [ data blocks ... ][ filter block ][ meta-index block ]
/// [ index block ][ footer ]
/// ```
pub struct TableBuilder {
    file: BufWriter<File>,
    offset: u64,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter_block: Option<FilterBlockBuilder>,
    filter_name: Option<String>,

    compression: CompressionType,
    block_size: u32,
    restart_interval: usize,

    /// Deferred index entry for the last finished data block.
    ///
    /// Writing it only once the next block's first key is known allows
    /// using a shortened separator instead of a full key.
    pending_index: Option<(InternalKey, BlockHandle)>,

    first_key: Option<InternalKey>,
    last_key: Option<InternalKey>,
    num_entries: u64,
    closed: bool,
}

impl TableBuilder {
    pub fn new(file: File, config: &Config) -> Self {
        let filter_block = config.filter_policy.clone().map(FilterBlockBuilder::new);

        let filter_name = config
            .filter_policy
            .as_ref()
            .map(|policy| format!("filter.{}", policy.name()));

        Self {
            file: BufWriter::new(file),
            offset: 0,
            data_block: BlockBuilder::new(config.block_restart_interval),
            index_block: BlockBuilder::new(1),
            filter_block,
            filter_name,
            compression: config.compression,
            block_size: config.block_size,
            restart_interval: config.block_restart_interval,
            pending_index: None,
            first_key: None,
            last_key: None,
            num_entries: 0,
            closed: false,
        }
    }

    /// Adds an entry. Keys must be strictly ascending in internal-key order.
    pub fn add(&mut self, item: &InternalValue) -> crate::Result<()> {
        assert!(!self.closed, "table builder already finished");

        if let Some(last) = &self.last_key {
            assert!(
                last < &item.key,
                "table entries must be added in ascending order",
            );
        }

        if let Some((last_key, handle)) = self.pending_index.take() {
            let sep = separator(&BytewiseComparator, &last_key, &item.key.user_key);
            self.index_block
                .add(&sep.encode(), &handle.encode_into_vec());
        }

        if let Some(filter) = &mut self.filter_block {
            filter.add_key(&item.key.user_key);
        }

        self.data_block.add(&item.key.encode(), &item.value);

        if self.first_key.is_none() {
            self.first_key = Some(item.key.clone());
        }
        self.last_key = Some(item.key.clone());
        self.num_entries += 1;

        if self.data_block.size_estimate() >= self.block_size as usize {
            self.flush_data_block()?;
        }

        Ok(())
    }

    fn flush_data_block(&mut self) -> crate::Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }

        let block = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(self.restart_interval),
        );
        let handle = self.write_block(&block.finish(), self.compression)?;

        #[expect(clippy::expect_used, reason = "a non-empty block has a last key")]
        let last_key = self.last_key.clone().expect("last key must exist");
        self.pending_index = Some((last_key, handle));

        if let Some(filter) = &mut self.filter_block {
            filter.start_block(self.offset);
        }

        Ok(())
    }

    fn write_block(
        &mut self,
        payload: &[u8],
        compression: CompressionType,
    ) -> crate::Result<BlockHandle> {
        let (stored, compression) = match compression {
            CompressionType::None => (payload.to_vec(), CompressionType::None),
            CompressionType::Snappy => {
                let compressed = compress(CompressionType::Snappy, payload)?;

                // Keep compression only when it saves at least 1/8th
                if compressed.len() < payload.len() - payload.len() / 8 {
                    (compressed, CompressionType::Snappy)
                } else {
                    (payload.to_vec(), CompressionType::None)
                }
            }
        };

        let handle = BlockHandle::new(self.offset, stored.len() as u64);

        let tag = u8::from(compression);
        let crc = checksum::checksum_chained(&stored, &[tag]);

        self.file.write_all(&stored)?;
        self.file.write_u8(tag)?;
        self.file.write_u32::<LittleEndian>(checksum::mask(crc))?;

        self.offset += stored.len() as u64 + BLOCK_TRAILER_SIZE as u64;

        Ok(handle)
    }

    /// Finishes the table, returning the final file size in bytes.
    ///
    /// The file is flushed and fsynced; the table may be referenced
    /// from the manifest as soon as this returns.
    pub fn finish(mut self) -> crate::Result<u64> {
        assert!(!self.closed, "table builder already finished");

        self.flush_data_block()?;
        self.closed = true;

        // Filter block (stored uncompressed)
        let filter_handle = match self.filter_block.take() {
            Some(filter) => Some(self.write_block(&filter.finish(), CompressionType::None)?),
            None => None,
        };

        // Meta-index block
        let mut metaindex = BlockBuilder::new(self.restart_interval);
        if let (Some(name), Some(handle)) = (&self.filter_name, filter_handle) {
            metaindex.add(name.as_bytes(), &handle.encode_into_vec());
        }
        let metaindex_handle = self.write_block(&metaindex.finish(), self.compression)?;

        // Index block, including the entry for the last data block
        if let Some((last_key, handle)) = self.pending_index.take() {
            let succ = successor(&BytewiseComparator, &last_key);
            self.index_block
                .add(&succ.encode(), &handle.encode_into_vec());
        }

        let index_block = std::mem::replace(&mut self.index_block, BlockBuilder::new(1));
        let index_handle = self.write_block(&index_block.finish(), self.compression)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        self.file.write_all(&footer.encode_into_vec())?;
        self.offset += FOOTER_SIZE as u64;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(self.offset)
    }

    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Current file size including buffered data.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.data_block.size_estimate() as u64
    }

    /// Smallest key added so far.
    #[must_use]
    pub fn first_key(&self) -> Option<&InternalKey> {
        self.first_key.as_ref()
    }

    /// Largest key added so far.
    #[must_use]
    pub fn last_key(&self) -> Option<&InternalKey> {
        self.last_key.as_ref()
    }
}
