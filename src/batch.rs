// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{read_delimited, write_delimited},
    memtable::Memtable,
    value::InternalValue,
    SeqNo, ValueType,
};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Cursor;

/// Payload prefix: 8-byte starting sequence number + 4-byte entry count.
const HEADER_SIZE: usize = 12;

/// An atomic group of writes
///
/// All entries of a batch become visible together; a crash either
/// preserves the whole batch or none of it.
///
/// The in-memory representation doubles as the write-ahead log record
/// payload: a 12-byte header followed by `(type, key [, value])` triples.
#[derive(Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
    count: u32,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rep: vec![0; HEADER_SIZE],
            count: 0,
        }
    }

    /// Queues a key-value insertion.
    pub fn put<K: AsRef<[u8]>, V: AsRef<[u8]>>(&mut self, key: K, value: V) {
        self.rep.push(ValueType::Value.into());

        #[expect(clippy::expect_used, reason = "writing to a vec cannot fail")]
        {
            write_delimited(&mut self.rep, key.as_ref()).expect("cannot fail");
            write_delimited(&mut self.rep, value.as_ref()).expect("cannot fail");
        }

        self.count += 1;
    }

    /// Queues a key deletion.
    pub fn delete<K: AsRef<[u8]>>(&mut self, key: K) {
        self.rep.push(ValueType::Tombstone.into());

        #[expect(clippy::expect_used, reason = "writing to a vec cannot fail")]
        write_delimited(&mut self.rep, key.as_ref()).expect("cannot fail");

        self.count += 1;
    }

    /// Removes all queued writes.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
        self.count = 0;
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.count
    }

    /// Whether the batch holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.rep.len()
    }

    /// Appends all entries of `other` to this batch.
    pub fn append(&mut self, other: &Self) {
        #[allow(clippy::indexing_slicing)]
        self.rep.extend_from_slice(&other.rep[HEADER_SIZE..]);
        self.count += other.count;
    }

    /// Starting sequence number stamped into the header.
    #[must_use]
    pub(crate) fn sequence(&self) -> SeqNo {
        #[allow(clippy::indexing_slicing)]
        LittleEndian::read_u64(&self.rep[..8])
    }

    pub(crate) fn set_sequence(&mut self, seqno: SeqNo) {
        #[allow(clippy::indexing_slicing)]
        LittleEndian::write_u64(&mut self.rep[..8], seqno);
    }

    /// The write-ahead log record payload.
    pub(crate) fn payload(&mut self) -> &[u8] {
        #[allow(clippy::indexing_slicing)]
        LittleEndian::write_u32(&mut self.rep[8..HEADER_SIZE], self.count);
        &self.rep
    }

    /// Parses a write-ahead log record back into a batch.
    pub(crate) fn from_payload(payload: &[u8]) -> crate::Result<Self> {
        if payload.len() < HEADER_SIZE {
            return Err(crate::Error::Corruption(
                "write batch record too short".into(),
            ));
        }

        #[allow(clippy::indexing_slicing)]
        let count = LittleEndian::read_u32(&payload[8..HEADER_SIZE]);

        let batch = Self {
            rep: payload.to_vec(),
            count,
        };

        // Validate eagerly so replay fails before applying half a batch
        let decoded = batch.iter().count() as u32;
        if decoded != count {
            return Err(crate::Error::Corruption(format!(
                "write batch count mismatch: header says {count}, found {decoded}",
            )));
        }

        Ok(batch)
    }

    /// Iterates over the queued entries in insertion order.
    ///
    /// Entries are `(type, key, value)`; tombstones carry an empty value.
    pub fn iter(&self) -> impl Iterator<Item = (ValueType, Vec<u8>, Vec<u8>)> + '_ {
        #[allow(clippy::indexing_slicing)]
        let mut cursor = Cursor::new(&self.rep[HEADER_SIZE..]);

        std::iter::from_fn(move || {
            let mut tag = [0];
            if std::io::Read::read_exact(&mut cursor, &mut tag).is_err() {
                return None;
            }

            let value_type = ValueType::try_from(tag[0]).ok()?;
            let key = read_delimited(&mut cursor).ok()?;

            let value = if value_type == ValueType::Value {
                read_delimited(&mut cursor).ok()?
            } else {
                vec![]
            };

            Some((value_type, key, value))
        })
    }

    /// Applies all entries into the given memtable, using consecutive
    /// sequence numbers starting at the batch sequence.
    pub(crate) fn apply_to(&self, memtable: &Memtable) {
        let mut seqno = self.sequence();

        for (value_type, key, value) in self.iter() {
            memtable.insert(InternalValue::from_components(key, value, seqno, value_type));
            seqno += 1;
        }
    }
}
