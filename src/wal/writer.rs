// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{RecordType, BLOCK_SIZE, HEADER_SIZE};
use crate::checksum;
use byteorder::{LittleEndian, WriteBytesExt};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

const ZEROES: [u8; HEADER_SIZE] = [0; HEADER_SIZE];

/// Appends records to a write-ahead log file
///
/// A record is either fully durable after [`Writer::sync`]
/// or absent after recovery.
pub struct Writer {
    file: BufWriter<File>,

    /// Write position inside the current 32 KiB block
    block_offset: usize,
}

impl Writer {
    /// Creates a new, empty log file.
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = File::create(path)?;

        Ok(Self {
            file: BufWriter::new(file),
            block_offset: 0,
        })
    }

    /// Appends one record, fragmenting it across blocks as needed.
    pub fn add_record(&mut self, payload: &[u8]) -> crate::Result<()> {
        let mut rest = payload;
        let mut is_first = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            if leftover < HEADER_SIZE {
                // Not even a header fits, pad out the block
                #[allow(clippy::indexing_slicing)]
                self.file.write_all(&ZEROES[..leftover])?;
                self.block_offset = 0;
            }

            let available = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let take = rest.len().min(available);

            let (fragment, tail) = rest.split_at(take);
            let is_last = tail.is_empty();

            let record_type = match (is_first, is_last) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, false) => RecordType::Middle,
                (false, true) => RecordType::Last,
            };

            self.write_fragment(record_type, fragment)?;

            rest = tail;
            is_first = false;

            if is_last {
                // Hand the record to the OS right away; a process
                // crash then cannot lose an acknowledged write
                self.file.flush()?;
                return Ok(());
            }
        }
    }

    fn write_fragment(&mut self, record_type: RecordType, payload: &[u8]) -> crate::Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        let crc = checksum::checksum_chained(&[record_type as u8], payload);

        self.file.write_u32::<LittleEndian>(checksum::mask(crc))?;
        self.file.write_u16::<LittleEndian>(payload.len() as u16)?;
        self.file.write_u8(record_type as u8)?;
        self.file.write_all(payload)?;

        self.block_offset += HEADER_SIZE + payload.len();

        Ok(())
    }

    /// Flushes buffered data to the OS.
    pub fn flush(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the log file.
    pub fn sync(&mut self) -> crate::Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}
