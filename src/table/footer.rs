// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Magic number at the very end of every table file
pub const TABLE_MAGIC: u64 = 0xdb47_7524_8b80_fb57;

/// Fixed footer size: two maximum-length block handles plus the magic.
pub const FOOTER_SIZE: usize = 2 * BlockHandle::MAX_ENCODED_LENGTH + 8;

/// Points to a block inside a table file
///
/// The size excludes the 5-byte block trailer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    /// Two varint64s are at most 10 bytes each.
    pub const MAX_ENCODED_LENGTH: usize = 20;

    #[must_use]
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
}

impl Encode for BlockHandle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64_varint(self.offset)?;
        writer.write_u64_varint(self.size)?;
        Ok(())
    }
}

impl Decode for BlockHandle {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let offset = reader.read_u64_varint()?;
        let size = reader.read_u64_varint()?;
        Ok(Self { offset, size })
    }
}

/// Fixed-size table footer
///
/// Sits at the very end of the file, so a reader can bootstrap from
/// just the file length: it points at the meta-index and index blocks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Encode for Footer {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);

        self.metaindex_handle.encode_into(&mut buf)?;
        self.index_handle.encode_into(&mut buf)?;

        // Pad handles to their maximum length
        buf.resize(FOOTER_SIZE - 8, 0);
        buf.extend_from_slice(&TABLE_MAGIC.to_le_bytes());

        writer.write_all(&buf)?;
        Ok(())
    }
}

impl Footer {
    /// Parses the footer, validating the magic number.
    pub fn decode(buf: &[u8]) -> crate::Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(crate::Error::Corruption("footer has wrong length".into()));
        }

        #[allow(clippy::indexing_slicing)]
        let magic = u64::from_le_bytes(
            buf[FOOTER_SIZE - 8..]
                .try_into()
                .map_err(|_| crate::Error::Corruption("footer magic unreadable".into()))?,
        );

        if magic != TABLE_MAGIC {
            return Err(crate::Error::Corruption(
                "not a table file (bad magic)".into(),
            ));
        }

        let mut reader = std::io::Cursor::new(buf);
        let metaindex_handle = BlockHandle::decode_from(&mut reader)?;
        let index_handle = BlockHandle::decode_from(&mut reader)?;

        Ok(Self {
            metaindex_handle,
            index_handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn handle_roundtrip() -> crate::Result<()> {
        for handle in [
            BlockHandle::new(0, 0),
            BlockHandle::new(1, 127),
            BlockHandle::new(12_345_678, u64::from(u32::MAX)),
            BlockHandle::new(u64::MAX, u64::MAX),
        ] {
            let buf = handle.encode_into_vec();
            assert!(buf.len() <= BlockHandle::MAX_ENCODED_LENGTH);

            let mut cursor = std::io::Cursor::new(buf);
            assert_eq!(handle, BlockHandle::decode_from(&mut cursor)?);
        }

        Ok(())
    }

    #[test]
    fn footer_roundtrip() -> crate::Result<()> {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(4_096, 128),
            index_handle: BlockHandle::new(8_192, 512),
        };

        let buf = footer.encode_into_vec();
        assert_eq!(FOOTER_SIZE, buf.len());
        assert_eq!(footer, Footer::decode(&buf)?);

        Ok(())
    }

    #[test]
    fn footer_rejects_bad_magic() {
        let footer = Footer {
            metaindex_handle: BlockHandle::new(0, 0),
            index_handle: BlockHandle::new(0, 0),
        };

        let mut buf = footer.encode_into_vec();
        *buf.last_mut().expect("footer is not empty") ^= 0xff;

        assert!(Footer::decode(&buf).is_err());
    }
}
