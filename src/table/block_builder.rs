// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use byteorder::{LittleEndian, WriteBytesExt};
use varint_rs::VarintWriter;

/// Serializes sorted key-value pairs into the block wire format
///
/// Keys are prefix-compressed against their predecessor; every
/// `restart_interval` entries a full key is stored and its offset
/// recorded in the restart array at the block tail:
///
/// ```text
/// [ shared varint ][ non_shared varint ][ value_len varint ]
/// [ key delta ][ value ]
/// ...
/// [ restart offsets u32 LE ... ][ restart count u32 LE ]
/// ```
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,

    /// Entries since the last restart point
    counter: usize,

    last_key: Vec<u8>,
}

impl BlockBuilder {
    #[must_use]
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);

        Self {
            buffer: vec![],
            restarts: vec![0],
            restart_interval,
            counter: 0,
            last_key: vec![],
        }
    }

    /// Appends an entry; keys must arrive in ascending internal-key
    /// order. Prefix sharing itself is computed bytewise.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.counter <= self.restart_interval);

        let shared = if self.counter < self.restart_interval {
            key.iter()
                .zip(self.last_key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        } else {
            // Restart point: store the full key
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        };

        #[expect(clippy::expect_used, reason = "writing to a vec cannot fail")]
        {
            self.buffer
                .write_u32_varint(shared as u32)
                .expect("cannot fail");
            self.buffer
                .write_u32_varint((key.len() - shared) as u32)
                .expect("cannot fail");
            self.buffer
                .write_u32_varint(value.len() as u32)
                .expect("cannot fail");
        }

        #[allow(clippy::indexing_slicing)]
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the finished payload.
    pub fn finish(mut self) -> Vec<u8> {
        #[expect(clippy::expect_used, reason = "writing to a vec cannot fail")]
        {
            for restart in &self.restarts {
                self.buffer
                    .write_u32::<LittleEndian>(*restart)
                    .expect("cannot fail");
            }
            self.buffer
                .write_u32::<LittleEndian>(self.restarts.len() as u32)
                .expect("cannot fail");
        }

        self.buffer
    }

    /// Estimated size of the finished block.
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::block::decode_entries;
    use test_log::test;

    #[test]
    fn block_builder_roundtrip() -> crate::Result<()> {
        let mut builder = BlockBuilder::new(4);

        let entries = (0..100)
            .map(|i| {
                (
                    format!("key{i:05}").into_bytes(),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect::<Vec<_>>();

        for (key, value) in &entries {
            builder.add(key, value);
        }

        let payload = builder.finish();
        let decoded = decode_entries(&payload)?;

        assert_eq!(entries.len(), decoded.len());
        for ((key, value), (decoded_key, decoded_value)) in entries.iter().zip(decoded.iter()) {
            assert_eq!(key, &decoded_key.to_vec());
            assert_eq!(value, &decoded_value.to_vec());
        }

        Ok(())
    }

    #[test]
    fn block_builder_empty() -> crate::Result<()> {
        let builder = BlockBuilder::new(16);
        assert!(builder.is_empty());

        let payload = builder.finish();
        assert!(decode_entries(&payload)?.is_empty());

        Ok(())
    }

    #[test]
    fn block_builder_shared_prefixes_shrink_output() {
        let long_common_prefix = b"a_very_long_shared_key_prefix_".to_vec();

        let mut with_sharing = BlockBuilder::new(16);
        let mut without_sharing = BlockBuilder::new(1);

        for i in 0..16 {
            let mut key = long_common_prefix.clone();
            key.extend_from_slice(format!("{i:02}").as_bytes());
            with_sharing.add(&key, b"");
            without_sharing.add(&key, b"");
        }

        assert!(with_sharing.finish().len() < without_sharing.finish().len());
    }
}
