// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod block;
pub mod block_builder;
pub mod builder;
pub mod filter_block;
pub mod footer;
pub mod iter;

pub use builder::TableBuilder;
pub use iter::TableIter;

use crate::{
    cache::Cache,
    coding::Decode,
    filter::FilterPolicy,
    key::InternalKey,
    table::{
        block::{read_block_payload, DataBlock, IndexBlock},
        filter_block::FilterBlockReader,
        footer::{BlockHandle, Footer, FOOTER_SIZE},
    },
    value::InternalValue,
    version::FileId,
    Config, UserKey,
};
use std::{fs::File, ops::Bound, sync::Arc};

/// An open, immutable, sorted table file
///
/// The footer, index block and filter block are loaded eagerly;
/// data blocks are fetched on demand through the block cache.
pub struct Table {
    /// Globally unique file number
    pub id: FileId,

    file: File,

    index: IndexBlock,
    filter: Option<(Arc<dyn FilterPolicy>, FilterBlockReader)>,

    cache: Arc<Cache>,
}

impl Table {
    /// Opens a table file, validating the footer.
    pub fn open(file: File, id: FileId, file_size: u64, config: &Config) -> crate::Result<Self> {
        if file_size < FOOTER_SIZE as u64 {
            return Err(crate::Error::Corruption(
                "file too short to be a table".into(),
            ));
        }

        let mut footer_buf = vec![0; FOOTER_SIZE];
        block::read_exact_at(&file, &mut footer_buf, file_size - FOOTER_SIZE as u64)?;
        let footer = Footer::decode(&footer_buf)?;

        let index_payload = read_block_payload(&file, footer.index_handle, /* verify */ true)?;
        let index = IndexBlock::decode(&index_payload)?;

        let filter = if let Some(policy) = &config.filter_policy {
            Self::load_filter(&file, footer.metaindex_handle, policy)?
        } else {
            None
        };

        Ok(Self {
            id,
            file,
            index,
            filter,
            cache: config.cache.clone(),
        })
    }

    fn load_filter(
        file: &File,
        metaindex_handle: BlockHandle,
        policy: &Arc<dyn FilterPolicy>,
    ) -> crate::Result<Option<(Arc<dyn FilterPolicy>, FilterBlockReader)>> {
        let payload = read_block_payload(file, metaindex_handle, /* verify */ true)?;

        let name = format!("filter.{}", policy.name());

        for (key, value) in block::decode_entries(&payload)? {
            if &*key == name.as_bytes() {
                let handle = BlockHandle::decode_from(&mut std::io::Cursor::new(&*value))?;
                let filter_payload = read_block_payload(file, handle, /* verify */ true)?;
                let reader = FilterBlockReader::new(filter_payload)?;
                return Ok(Some((policy.clone(), reader)));
            }
        }

        // Table was written without (or with another) filter policy
        Ok(None)
    }

    /// Number of data blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.index.items.len()
    }

    pub(crate) fn index_items(&self) -> &[(InternalKey, BlockHandle)] {
        &self.index.items
    }

    /// Loads a data block, going through the block cache.
    pub(crate) fn read_data_block(
        &self,
        handle: BlockHandle,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> crate::Result<Arc<DataBlock>> {
        if let Some(block) = self.cache.get_block(self.id, handle.offset) {
            return Ok(block);
        }

        let payload = read_block_payload(&self.file, handle, verify_checksums)?;
        let block = Arc::new(DataBlock::decode(&payload)?);

        if fill_cache {
            self.cache
                .insert_block(self.id, handle.offset, block.clone());
        }

        Ok(block)
    }

    /// Point lookup: returns the first entry at or after `target`
    /// within the candidate data block, if any.
    ///
    /// The caller decides whether the entry actually matches the
    /// wanted user key and is visible.
    pub fn internal_get(
        &self,
        target: &InternalKey,
        verify_checksums: bool,
        fill_cache: bool,
    ) -> crate::Result<Option<InternalValue>> {
        let block_index = self.index.seek_index(target);

        let Some(&(_, handle)) = self.index.items.get(block_index) else {
            // Past the last block
            return Ok(None);
        };

        if let Some((policy, filter)) = &self.filter {
            if !filter.key_may_match(&**policy, handle.offset, &target.user_key) {
                return Ok(None);
            }
        }

        let block = self.read_data_block(handle, verify_checksums, fill_cache)?;

        Ok(block.seek(target).cloned())
    }

    /// Iterates the whole table in internal-key order.
    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter::new(
            self.clone(),
            (Bound::Unbounded, Bound::Unbounded),
            false,
            true,
        )
    }

    /// Iterates a user-key range of the table.
    pub fn range(
        self: &Arc<Self>,
        bounds: (Bound<UserKey>, Bound<UserKey>),
        verify_checksums: bool,
        fill_cache: bool,
    ) -> TableIter {
        TableIter::new(self.clone(), bounds, verify_checksums, fill_cache)
    }
}
