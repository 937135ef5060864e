// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::checksum;
use byteorder::{ByteOrder, LittleEndian};
use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

/// Replays records from a write-ahead log file
///
/// A truncated fragment at the end of the file is treated as a clean
/// end of log (the record was never acknowledged); a checksum or
/// framing violation in the middle surfaces as a corruption error.
pub struct Reader {
    file: BufReader<File>,

    /// Read position inside the current 32 KiB block
    block_offset: usize,
}

impl Reader {
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = File::open(path)?;

        Ok(Self {
            file: BufReader::new(file),
            block_offset: 0,
        })
    }

    /// Reads the next record, reassembling fragments.
    ///
    /// Returns `None` at the end of the log.
    pub fn read_record(&mut self) -> crate::Result<Option<Vec<u8>>> {
        let mut record: Option<Vec<u8>> = None;

        loop {
            let Some((record_type, fragment)) = self.read_fragment()? else {
                // A dangling first half of a record is dropped
                // like any other unfinished write
                return Ok(None);
            };

            match (record_type, &mut record) {
                (RecordType::Full, None) => return Ok(Some(fragment)),
                (RecordType::First, None) => record = Some(fragment),
                (RecordType::Middle, Some(buf)) => buf.extend_from_slice(&fragment),
                (RecordType::Last, Some(buf)) => {
                    buf.extend_from_slice(&fragment);
                    return Ok(record);
                }
                _ => {
                    return Err(crate::Error::Corruption(format!(
                        "unexpected {record_type:?} fragment in log",
                    )));
                }
            }
        }
    }

    fn read_fragment(&mut self) -> crate::Result<Option<(RecordType, Vec<u8>)>> {
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            if leftover < HEADER_SIZE {
                // Skip block padding
                if !self.skip_exact(leftover)? {
                    return Ok(None);
                }
                self.block_offset = 0;
                continue;
            }

            let mut header = [0; HEADER_SIZE];
            if !self.read_exact_or_eof(&mut header)? {
                return Ok(None);
            }

            let stored_crc = checksum::unmask(LittleEndian::read_u32(&header));

            #[allow(clippy::indexing_slicing)]
            let length = LittleEndian::read_u16(&header[4..6]) as usize;

            let type_byte = header[6];

            if HEADER_SIZE + length > leftover {
                return Err(crate::Error::Corruption(
                    "log fragment overflows block".into(),
                ));
            }

            let record_type = RecordType::try_from(type_byte).map_err(|()| {
                crate::Error::Corruption(format!("invalid log record type {type_byte}"))
            })?;

            let mut payload = vec![0; length];
            if !self.read_exact_or_eof(&mut payload)? {
                return Ok(None);
            }

            self.block_offset += HEADER_SIZE + length;

            let actual_crc = checksum::checksum_chained(&[type_byte], &payload);
            if actual_crc != stored_crc {
                return Err(crate::Error::InvalidChecksum((actual_crc, stored_crc)));
            }

            return Ok(Some((record_type, payload)));
        }
    }

    /// Reads into the buffer, returning `false` on a clean or mid-read EOF.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> crate::Result<bool> {
        let mut filled = 0;

        while filled < buf.len() {
            #[allow(clippy::indexing_slicing)]
            let n = self.file.read(&mut buf[filled..])?;

            if n == 0 {
                return Ok(false);
            }

            filled += n;
        }

        Ok(true)
    }

    fn skip_exact(&mut self, n: usize) -> crate::Result<bool> {
        let mut buf = vec![0; n];
        self.read_exact_or_eof(&mut buf)
    }
}
