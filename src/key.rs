// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    value::{MAX_SEQNO, VALUE_TYPE_FOR_SEEK},
    SeqNo, UserKey, ValueType,
};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Reverse;

/// Length of the `(seqno << 8) | value_type` trailer
/// appended to every user key on disk.
pub const TRAILER_SIZE: usize = 8;

/// A user key, tagged with a sequence number and value type
///
/// This is the native sort key of the engine: user key ascending,
/// then trailer descending, so newer writes precede older ones.
#[derive(Clone, Eq)]
#[allow(clippy::module_name_repetitions)]
pub struct InternalKey {
    pub user_key: UserKey,
    pub seqno: SeqNo,
    pub value_type: ValueType,
}

impl AsRef<[u8]> for InternalKey {
    fn as_ref(&self) -> &[u8] {
        &self.user_key
    }
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.user_key == other.user_key && self.trailer() == other.trailer()
    }
}

impl std::hash::Hash for InternalKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(&self.user_key);
        state.write_u64(self.trailer());
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}",
            self.user_key,
            self.seqno,
            match self.value_type {
                ValueType::Value => "V",
                ValueType::Tombstone => "T",
            },
        )
    }
}

impl InternalKey {
    pub fn new<K: Into<UserKey>>(user_key: K, seqno: SeqNo, value_type: ValueType) -> Self {
        let user_key = user_key.into();

        assert!(
            u16::try_from(user_key.len()).is_ok(),
            "keys can be 65535 bytes in length",
        );
        assert!(seqno <= MAX_SEQNO, "sequence number overflow");

        Self {
            user_key,
            seqno,
            value_type,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value_type == ValueType::Tombstone
    }

    /// Packed `(seqno << 8) | type` tag.
    #[must_use]
    pub fn trailer(&self) -> u64 {
        (self.seqno << 8) | u64::from(u8::from(self.value_type))
    }

    /// Serialized length (user key + trailer).
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.user_key.len() + TRAILER_SIZE
    }

    /// Appends the on-disk form (user key, then 8-byte LE trailer).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.user_key);

        let mut trailer = [0; TRAILER_SIZE];
        LittleEndian::write_u64(&mut trailer, self.trailer());
        out.extend_from_slice(&trailer);
    }

    /// Returns the on-disk form as a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    /// Parses an on-disk internal key.
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        let Some(split) = bytes.len().checked_sub(TRAILER_SIZE) else {
            return Err(crate::Error::Corruption(
                "internal key shorter than trailer".into(),
            ));
        };

        #[allow(clippy::indexing_slicing)]
        let (user_key, trailer) = (&bytes[..split], &bytes[split..]);
        let trailer = LittleEndian::read_u64(trailer);

        let value_type = ValueType::try_from((trailer & 0xff) as u8).map_err(|()| {
            crate::Error::Corruption(format!("invalid value type {}", trailer & 0xff))
        })?;

        Ok(Self {
            user_key: user_key.into(),
            seqno: trailer >> 8,
            value_type,
        })
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Order by user key, THEN by trailer (so by seqno) descending
// This is one of the most important functions
// Otherwise queries will not match expected behaviour
impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.user_key, Reverse(self.trailer())).cmp(&(&other.user_key, Reverse(other.trailer())))
    }
}

/// Internal key positioned so that a seek finds the newest entry
/// of `user_key` with a sequence number at or below `seqno`.
#[must_use]
pub fn lookup_key<K: Into<UserKey>>(user_key: K, seqno: SeqNo) -> InternalKey {
    InternalKey::new(user_key, seqno, VALUE_TYPE_FOR_SEEK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn key_cmp_user_key() {
        let a = InternalKey::new(*b"a", 0, ValueType::Value);
        let b = InternalKey::new(*b"b", 0, ValueType::Value);
        assert!(a < b);
    }

    #[test]
    fn key_cmp_seqno() {
        let a = InternalKey::new(*b"a", 0, ValueType::Value);
        let b = InternalKey::new(*b"a", 1, ValueType::Value);
        assert!(a > b);
    }

    #[test]
    fn key_cmp_value_type() {
        // For equal (key, seqno), the value tag breaks the tie,
        // and values sort before tombstones
        let put = InternalKey::new(*b"a", 5, ValueType::Value);
        let del = InternalKey::new(*b"a", 5, ValueType::Tombstone);
        assert!(put < del);
    }

    #[test]
    fn key_roundtrip() -> crate::Result<()> {
        let key = InternalKey::new(*b"hello", 42, ValueType::Tombstone);
        let decoded = InternalKey::decode(&key.encode())?;

        assert_eq!(key, decoded);
        assert_eq!(42, decoded.seqno);
        assert_eq!(ValueType::Tombstone, decoded.value_type);
        assert_eq!(b"hello", &*decoded.user_key);

        Ok(())
    }

    #[test]
    fn key_decode_too_short() {
        assert!(InternalKey::decode(b"abc").is_err());
    }

    #[test]
    fn lookup_key_position() {
        // The lookup key must sort at or before every entry with seqno <= s,
        // and after every entry with seqno > s
        let lookup = lookup_key(*b"k", 10);

        let newer = InternalKey::new(*b"k", 11, ValueType::Value);
        let exact = InternalKey::new(*b"k", 10, ValueType::Value);
        let exact_del = InternalKey::new(*b"k", 10, ValueType::Tombstone);
        let older = InternalKey::new(*b"k", 9, ValueType::Value);

        assert!(newer < lookup);
        assert!(lookup <= exact);
        assert!(lookup < exact_del);
        assert!(lookup < older);
    }
}
