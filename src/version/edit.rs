// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{FileId, FileMetaData};
use crate::{
    coding::{read_delimited, write_delimited, Decode, DecodeError, Encode, EncodeError},
    key::InternalKey,
    SeqNo,
};
use std::{
    io::{Read, Write},
    sync::Arc,
};
use varint_rs::{VarintReader, VarintWriter};

/// Field tags of the manifest encoding
mod tag {
    pub const COMPARATOR: u32 = 1;
    pub const LOG_NUMBER: u32 = 2;
    pub const NEXT_FILE_NUMBER: u32 = 3;
    pub const LAST_SEQUENCE: u32 = 4;
    pub const COMPACT_POINTER: u32 = 5;
    pub const DELETED_FILE: u32 = 6;
    pub const NEW_FILE: u32 = 7;
    pub const PREV_LOG_NUMBER: u32 = 9;
}

/// The difference between two consecutive versions
///
/// Serialized as a sequence of tagged varint fields; the manifest is
/// an append-only stream of these.
#[derive(Clone, Debug, Default)]
pub struct VersionEdit {
    pub comparator: Option<String>,
    pub log_number: Option<FileId>,
    pub prev_log_number: Option<FileId>,
    pub next_file_number: Option<FileId>,
    pub last_sequence: Option<SeqNo>,

    pub compact_pointers: Vec<(usize, InternalKey)>,
    pub deleted_files: Vec<(usize, FileId)>,
    pub new_files: Vec<(usize, Arc<FileMetaData>)>,
}

impl VersionEdit {
    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator = Some(name.to_owned());
    }

    pub fn set_log_number(&mut self, n: FileId) {
        self.log_number = Some(n);
    }

    pub fn set_prev_log_number(&mut self, n: FileId) {
        self.prev_log_number = Some(n);
    }

    pub fn set_next_file_number(&mut self, n: FileId) {
        self.next_file_number = Some(n);
    }

    pub fn set_last_sequence(&mut self, n: SeqNo) {
        self.last_sequence = Some(n);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Records a file addition at the given level.
    pub fn add_file(&mut self, level: usize, file: Arc<FileMetaData>) {
        self.new_files.push((level, file));
    }

    /// Records a file deletion at the given level.
    pub fn remove_file(&mut self, level: usize, number: FileId) {
        self.deleted_files.push((level, number));
    }
}

impl Encode for VersionEdit {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        if let Some(comparator) = &self.comparator {
            writer.write_u32_varint(tag::COMPARATOR)?;
            write_delimited(writer, comparator.as_bytes())?;
        }

        if let Some(n) = self.log_number {
            writer.write_u32_varint(tag::LOG_NUMBER)?;
            writer.write_u64_varint(n)?;
        }

        if let Some(n) = self.prev_log_number {
            writer.write_u32_varint(tag::PREV_LOG_NUMBER)?;
            writer.write_u64_varint(n)?;
        }

        if let Some(n) = self.next_file_number {
            writer.write_u32_varint(tag::NEXT_FILE_NUMBER)?;
            writer.write_u64_varint(n)?;
        }

        if let Some(n) = self.last_sequence {
            writer.write_u32_varint(tag::LAST_SEQUENCE)?;
            writer.write_u64_varint(n)?;
        }

        for (level, key) in &self.compact_pointers {
            writer.write_u32_varint(tag::COMPACT_POINTER)?;
            writer.write_u32_varint(*level as u32)?;
            write_delimited(writer, &key.encode())?;
        }

        for (level, number) in &self.deleted_files {
            writer.write_u32_varint(tag::DELETED_FILE)?;
            writer.write_u32_varint(*level as u32)?;
            writer.write_u64_varint(*number)?;
        }

        for (level, file) in &self.new_files {
            writer.write_u32_varint(tag::NEW_FILE)?;
            writer.write_u32_varint(*level as u32)?;
            writer.write_u64_varint(file.number)?;
            writer.write_u64_varint(file.size)?;
            write_delimited(writer, &file.smallest.encode())?;
            write_delimited(writer, &file.largest.encode())?;
        }

        Ok(())
    }
}

fn read_internal_key<R: Read>(reader: &mut R) -> Result<InternalKey, DecodeError> {
    let bytes = read_delimited(reader)?;
    InternalKey::decode(&bytes).map_err(|_| DecodeError::InvalidHeader("InternalKey"))
}

impl Decode for VersionEdit {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut edit = Self::default();

        loop {
            let tag = match reader.read_u32_varint() {
                Ok(tag) => tag,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };

            match tag {
                tag::COMPARATOR => {
                    let name = read_delimited(reader)?;
                    let name = String::from_utf8(name)
                        .map_err(|_| DecodeError::InvalidHeader("comparator name"))?;
                    edit.comparator = Some(name);
                }
                tag::LOG_NUMBER => edit.log_number = Some(reader.read_u64_varint()?),
                tag::PREV_LOG_NUMBER => edit.prev_log_number = Some(reader.read_u64_varint()?),
                tag::NEXT_FILE_NUMBER => edit.next_file_number = Some(reader.read_u64_varint()?),
                tag::LAST_SEQUENCE => edit.last_sequence = Some(reader.read_u64_varint()?),
                tag::COMPACT_POINTER => {
                    let level = reader.read_u32_varint()? as usize;
                    let key = read_internal_key(reader)?;
                    edit.compact_pointers.push((level, key));
                }
                tag::DELETED_FILE => {
                    let level = reader.read_u32_varint()? as usize;
                    let number = reader.read_u64_varint()?;
                    edit.deleted_files.push((level, number));
                }
                tag::NEW_FILE => {
                    let level = reader.read_u32_varint()? as usize;
                    let number = reader.read_u64_varint()?;
                    let size = reader.read_u64_varint()?;
                    let smallest = read_internal_key(reader)?;
                    let largest = read_internal_key(reader)?;

                    edit.new_files.push((
                        level,
                        Arc::new(FileMetaData::new(number, size, smallest, largest)),
                    ));
                }
                _ => return Err(DecodeError::InvalidTag(("VersionEdit", tag as u8))),
            }
        }

        Ok(edit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;
    use test_log::test;

    #[test]
    fn edit_roundtrip() -> crate::Result<()> {
        let mut edit = VersionEdit::default();
        edit.set_comparator_name("lsm_kv.BytewiseComparator");
        edit.set_log_number(12);
        edit.set_prev_log_number(0);
        edit.set_next_file_number(33);
        edit.set_last_sequence(9_000);
        edit.set_compact_pointer(2, InternalKey::new(*b"pointer", 5, ValueType::Value));
        edit.remove_file(1, 4);
        edit.remove_file(6, 27);
        edit.add_file(
            2,
            Arc::new(FileMetaData::new(
                99,
                4_096,
                InternalKey::new(*b"aaa", 100, ValueType::Value),
                InternalKey::new(*b"zzz", 50, ValueType::Tombstone),
            )),
        );

        let buf = edit.encode_into_vec();
        let decoded = VersionEdit::decode_from(&mut std::io::Cursor::new(buf))?;

        assert_eq!(Some("lsm_kv.BytewiseComparator".into()), decoded.comparator);
        assert_eq!(Some(12), decoded.log_number);
        assert_eq!(Some(0), decoded.prev_log_number);
        assert_eq!(Some(33), decoded.next_file_number);
        assert_eq!(Some(9_000), decoded.last_sequence);

        assert_eq!(1, decoded.compact_pointers.len());
        assert_eq!(2, decoded.compact_pointers[0].0);
        assert_eq!(b"pointer", &*decoded.compact_pointers[0].1.user_key);

        assert_eq!(vec![(1, 4), (6, 27)], decoded.deleted_files);

        assert_eq!(1, decoded.new_files.len());
        let (level, file) = &decoded.new_files[0];
        assert_eq!(2, *level);
        assert_eq!(99, file.number);
        assert_eq!(4_096, file.size);
        assert_eq!(b"aaa", &*file.smallest.user_key);
        assert_eq!(b"zzz", &*file.largest.user_key);
        assert_eq!(ValueType::Tombstone, file.largest.value_type);

        Ok(())
    }

    #[test]
    fn edit_decode_rejects_unknown_tag() {
        let mut buf = vec![];
        use varint_rs::VarintWriter;
        buf.write_u32_varint(42).expect("cannot fail");

        assert!(VersionEdit::decode_from(&mut std::io::Cursor::new(buf)).is_err());
    }
}
