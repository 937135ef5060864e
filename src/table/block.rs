// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::footer::BlockHandle;
use crate::{
    checksum,
    coding::Decode,
    compression::{decompress, CompressionType},
    key::InternalKey,
    value::InternalValue,
    Slice,
};
use byteorder::{ByteOrder, LittleEndian};
use std::{fs::File, io::Read};
use varint_rs::VarintReader;

/// Every block is followed by a 1-byte compression tag and a
/// 4-byte masked checksum of payload + tag.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Decodes the entries of a block payload (prefix compression undone).
pub fn decode_entries(payload: &[u8]) -> crate::Result<Vec<(Slice, Slice)>> {
    if payload.len() < 4 {
        return Err(crate::Error::Corruption("block too short".into()));
    }

    #[allow(clippy::indexing_slicing)]
    let restart_count = LittleEndian::read_u32(&payload[payload.len() - 4..]) as usize;

    let restart_area = restart_count
        .checked_mul(4)
        .and_then(|x| x.checked_add(4))
        .ok_or_else(|| crate::Error::Corruption("bogus restart count".into()))?;

    let Some(data_end) = payload.len().checked_sub(restart_area) else {
        return Err(crate::Error::Corruption(
            "restart array overflows block".into(),
        ));
    };

    #[allow(clippy::indexing_slicing)]
    let mut cursor = std::io::Cursor::new(&payload[..data_end]);

    let mut entries = vec![];
    let mut last_key: Vec<u8> = vec![];

    while (cursor.position() as usize) < data_end {
        let shared = cursor.read_u32_varint()? as usize;
        let non_shared = cursor.read_u32_varint()? as usize;
        let value_len = cursor.read_u32_varint()? as usize;

        if shared > last_key.len() {
            return Err(crate::Error::Corruption(
                "key prefix exceeds previous key".into(),
            ));
        }

        last_key.truncate(shared);

        let mut delta = vec![0; non_shared];
        cursor.read_exact(&mut delta)?;
        last_key.extend_from_slice(&delta);

        let mut value = vec![0; value_len];
        cursor.read_exact(&mut value)?;

        entries.push((Slice::from(last_key.as_slice()), Slice::from(value)));
    }

    Ok(entries)
}

/// A decoded data block: internal keys with their values, sorted
#[derive(Debug)]
pub struct DataBlock {
    pub items: Vec<InternalValue>,

    /// Decoded byte size, used as the cache charge
    size: usize,
}

impl DataBlock {
    pub fn decode(payload: &[u8]) -> crate::Result<Self> {
        let items = decode_entries(payload)?
            .into_iter()
            .map(|(key, value)| Ok(InternalValue::new(InternalKey::decode(&key)?, value)))
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self {
            items,
            size: payload.len(),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Index of the first item with key >= target.
    #[must_use]
    pub fn seek_index(&self, target: &InternalKey) -> usize {
        self.items.partition_point(|item| item.key < *target)
    }

    /// Returns the first item with key >= target.
    #[must_use]
    pub fn seek(&self, target: &InternalKey) -> Option<&InternalValue> {
        self.items.get(self.seek_index(target))
    }
}

/// A decoded index block: one separator key + handle per data block
#[derive(Debug)]
pub struct IndexBlock {
    pub items: Vec<(InternalKey, BlockHandle)>,
}

impl IndexBlock {
    pub fn decode(payload: &[u8]) -> crate::Result<Self> {
        let items = decode_entries(payload)?
            .into_iter()
            .map(|(key, value)| {
                let key = InternalKey::decode(&key)?;
                let handle = BlockHandle::decode_from(&mut std::io::Cursor::new(&*value))?;
                Ok((key, handle))
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Self { items })
    }

    /// Index of the block that may contain `target`: the first block
    /// whose separator key is >= target.
    #[must_use]
    pub fn seek_index(&self, target: &InternalKey) -> usize {
        self.items.partition_point(|(key, _)| key < target)
    }
}

/// Reads a block from a file and verifies its trailer.
///
/// Returns the decompressed payload.
pub fn read_block_payload(
    file: &File,
    handle: BlockHandle,
    verify_checksum: bool,
) -> crate::Result<Vec<u8>> {
    let mut buf = vec![0; handle.size as usize + BLOCK_TRAILER_SIZE];
    read_exact_at(file, &mut buf, handle.offset)?;

    #[allow(clippy::indexing_slicing)]
    let (raw, trailer) = buf.split_at(handle.size as usize);

    let compression_tag = trailer[0];

    #[allow(clippy::indexing_slicing)]
    let stored_crc = checksum::unmask(LittleEndian::read_u32(&trailer[1..]));

    if verify_checksum {
        let actual_crc = checksum::checksum_chained(raw, &[compression_tag]);
        if actual_crc != stored_crc {
            return Err(crate::Error::InvalidChecksum((actual_crc, stored_crc)));
        }
    }

    let compression = CompressionType::try_from(compression_tag).map_err(|()| {
        crate::Error::Corruption(format!("invalid block compression tag {compression_tag}"))
    })?;

    decompress(compression, raw)
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(
    file: &File,
    mut buf: &mut [u8],
    mut offset: u64,
) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = std::os::windows::fs::FileExt::seek_read(file, buf, offset)?;

        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "failed to fill whole buffer",
            ));
        }

        buf = &mut buf[n..];
        offset += n as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{table::block_builder::BlockBuilder, ValueType};
    use test_log::test;

    fn sample_block() -> DataBlock {
        let mut builder = BlockBuilder::new(4);

        for i in 0..50 {
            let key = InternalKey::new(format!("key{i:04}").into_bytes(), 9, ValueType::Value);
            builder.add(&key.encode(), b"v");
        }

        DataBlock::decode(&builder.finish()).expect("should decode")
    }

    #[test]
    fn data_block_seek() {
        let block = sample_block();

        let target = InternalKey::new(*b"key0010", u64::MAX >> 8, ValueType::Value);
        let found = block.seek(&target).expect("should find");
        assert_eq!(b"key0010", &*found.key.user_key);

        // Seeking with a lower seqno skips to the next user key
        let target = InternalKey::new(*b"key0010", 3, ValueType::Value);
        let found = block.seek(&target).expect("should find");
        assert_eq!(b"key0011", &*found.key.user_key);

        // Past the end
        let target = InternalKey::new(*b"zzz", u64::MAX >> 8, ValueType::Value);
        assert!(block.seek(&target).is_none());
    }

    #[test]
    fn decode_rejects_truncated_restart_array() {
        // Claims more restarts than the payload can hold
        let mut payload = vec![0u8; 8];
        let len = payload.len();
        LittleEndian::write_u32(&mut payload[len - 4..], 1_000);

        assert!(decode_entries(&payload).is_err());
    }
}
