// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Write-ahead log record framing
//!
//! The log is a sequence of 32 KiB blocks. Each record is split into
//! one or more fragments, each carrying a 7-byte header:
//!
//! ```text
//! [ crc u32 LE ][ length u16 LE ][ type u8 ] [ payload ... ]
//! ```
//!
//! The checksum covers the type byte and the payload and is stored
//! masked. Fragments never span blocks; a block tail shorter than a
//! header is zero-padded. The same framing is used for the manifest.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

pub const BLOCK_SIZE: usize = 32 * 1_024;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum RecordType {
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl TryFrom<u8> for RecordType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Full),
            2 => Ok(Self::First),
            3 => Ok(Self::Middle),
            4 => Ok(Self::Last),
            _ => Err(()),
        }
    }
}
