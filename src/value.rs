// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{key::InternalKey, Slice};

/// User defined key
pub type UserKey = Slice;

/// User defined data (blob of bytes)
#[allow(clippy::module_name_repetitions)]
pub type UserValue = Slice;

/// Sequence number - a monotonically increasing counter
///
/// A value with a higher sequence number shadows an item with the
/// same key and lower sequence number.
///
/// Stale items are lazily garbage-collected during compaction.
pub type SeqNo = u64;

/// Sequence numbers are packed into the upper 56 bits of the
/// internal key trailer.
pub const MAX_SEQNO: SeqNo = (1 << 56) - 1;

/// Value type (regular value or tombstone)
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[allow(clippy::module_name_repetitions)]
pub enum ValueType {
    /// Deleted value
    Tombstone,

    /// Existing value
    Value,
}

/// The value type to use when constructing a lookup key.
///
/// `Value` has the higher tag, so a seek lands on the newest
/// entry with the wanted sequence number.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl TryFrom<u8> for ValueType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Tombstone),
            1 => Ok(Self::Value),
            _ => Err(()),
        }
    }
}

impl From<ValueType> for u8 {
    fn from(value: ValueType) -> Self {
        match value {
            ValueType::Tombstone => 0,
            ValueType::Value => 1,
        }
    }
}

/// Internal representation of KV pairs
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Eq)]
pub struct InternalValue {
    /// Internal key
    pub key: InternalKey,

    /// User-defined value - an arbitrary byte array
    ///
    /// Supports up to 2^32 bytes
    pub value: UserValue,
}

impl InternalValue {
    /// Creates a new [`InternalValue`].
    ///
    /// # Panics
    ///
    /// Panics if the value length is greater than 2^32.
    pub fn new<V: Into<UserValue>>(key: InternalKey, value: V) -> Self {
        let value = value.into();

        assert!(
            u32::try_from(value.len()).is_ok(),
            "values can be 2^32 bytes in length"
        );

        Self { key, value }
    }

    /// Creates a new [`InternalValue`] from its pieces.
    pub fn from_components<K: Into<UserKey>, V: Into<UserValue>>(
        user_key: K,
        value: V,
        seqno: SeqNo,
        value_type: ValueType,
    ) -> Self {
        let key = InternalKey::new(user_key, seqno, value_type);
        Self::new(key, value)
    }

    /// Creates a new tombstone.
    pub fn new_tombstone<K: Into<UserKey>>(key: K, seqno: SeqNo) -> Self {
        let key = InternalKey::new(key, seqno, ValueType::Tombstone);
        Self::new(key, vec![])
    }

    #[doc(hidden)]
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.key.is_tombstone()
    }

    /// Size of key + value when resident in memory.
    #[must_use]
    pub fn size(&self) -> usize {
        self.key.user_key.len() + self.value.len() + std::mem::size_of::<Self>()
    }
}

impl PartialEq for InternalValue {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Ord for InternalValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl PartialOrd for InternalValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for InternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} => {:?}",
            self.key,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn value_type_tags() {
        assert_eq!(0u8, ValueType::Tombstone.into());
        assert_eq!(1u8, ValueType::Value.into());
        assert_eq!(Ok(ValueType::Value), ValueType::try_from(1));
        assert!(ValueType::try_from(2).is_err());
    }

    #[test]
    fn value_cmp_user_key() {
        let a = InternalValue::from_components(*b"a", *b"", 0, ValueType::Value);
        let b = InternalValue::from_components(*b"b", *b"", 0, ValueType::Value);
        assert!(a < b);
    }

    #[test]
    fn value_cmp_seqno() {
        let a = InternalValue::from_components(*b"a", *b"", 0, ValueType::Value);
        let b = InternalValue::from_components(*b"a", *b"", 1, ValueType::Value);
        assert!(a > b);
    }
}
