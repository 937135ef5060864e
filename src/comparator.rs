// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::key::InternalKey;
use std::cmp::Ordering;

/// A total order over user keys
///
/// The separator and successor helpers allow the table writer to
/// shorten index keys between blocks; implementations may return the
/// inputs unchanged.
pub trait Comparator: Send + Sync {
    /// Name of the comparator, recorded in the manifest.
    ///
    /// A database must always be opened with the comparator
    /// it was created with.
    fn name(&self) -> &'static str;

    /// Compares two user keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns a possibly shortened key `k` with `start <= k < limit`.
    ///
    /// Used to cut down index entries between two data blocks.
    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8>;

    /// Returns a possibly shortened key that is `>= key`.
    fn find_short_successor(&self, key: &[u8]) -> Vec<u8>;
}

/// Lexicographic byte-string ordering
#[derive(Copy, Clone, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "lsm_kv.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        // Find length of common prefix
        let shared = start
            .iter()
            .zip(limit.iter())
            .take_while(|(a, b)| a == b)
            .count();

        if shared == start.len() || shared == limit.len() {
            // One string is a prefix of the other, do not shorten
            return start.to_vec();
        }

        #[allow(clippy::indexing_slicing)]
        let diff = start[shared];

        #[allow(clippy::indexing_slicing)]
        if diff < 0xff && diff + 1 < limit[shared] {
            let mut sep = start[..=shared].to_vec();
            sep[shared] += 1;
            debug_assert!(sep.as_slice() < limit);
            return sep;
        }

        start.to_vec()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        // Find first byte that can be incremented
        for (idx, byte) in key.iter().enumerate() {
            if *byte != 0xff {
                let mut successor = key[..=idx].to_vec();

                #[allow(clippy::indexing_slicing)]
                {
                    successor[idx] += 1;
                }

                return successor;
            }
        }

        // Key is a run of 0xff, leave unchanged
        key.to_vec()
    }
}

/// Computes a shortened index key that sorts in `[last_key, next_user_key)`.
///
/// Only the user key portion is shortened; the trailer of `last_key`
/// is preserved so ordering against other internal keys is unchanged.
pub(crate) fn separator<C: Comparator>(
    comparator: &C,
    last_key: &InternalKey,
    next_user_key: &[u8],
) -> InternalKey {
    let sep = comparator.find_shortest_separator(&last_key.user_key, next_user_key);

    if sep.len() < last_key.user_key.len()
        && comparator.compare(&last_key.user_key, &sep) == Ordering::Less
    {
        InternalKey::new(sep, last_key.seqno, last_key.value_type)
    } else {
        last_key.clone()
    }
}

/// Computes a shortened index key that sorts at or after `last_key`.
pub(crate) fn successor<C: Comparator>(comparator: &C, last_key: &InternalKey) -> InternalKey {
    let succ = comparator.find_short_successor(&last_key.user_key);

    if succ.len() < last_key.user_key.len()
        && comparator.compare(&last_key.user_key, &succ) == Ordering::Less
    {
        InternalKey::new(succ, last_key.seqno, last_key.value_type)
    } else {
        last_key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;
    use test_log::test;

    #[test]
    fn bytewise_separator() {
        let c = BytewiseComparator;

        assert_eq!(b"b".to_vec(), c.find_shortest_separator(b"abc", b"zzz"));
        assert_eq!(
            b"abc".to_vec(),
            c.find_shortest_separator(b"abc", b"abcdef"),
        );
        assert_eq!(b"abc".to_vec(), c.find_shortest_separator(b"abc", b"abd"));

        let sep = c.find_shortest_separator(b"abcdef", b"abzz");
        assert!(b"abcdef".as_slice() <= sep.as_slice());
        assert!(sep.as_slice() < b"abzz".as_slice());
    }

    #[test]
    fn bytewise_successor() {
        let c = BytewiseComparator;

        assert_eq!(b"b".to_vec(), c.find_short_successor(b"abc"));
        assert_eq!(
            vec![0xff, 0xff],
            c.find_short_successor(&[0xff, 0xff]),
        );
        assert_eq!(vec![0xff, 0x02], c.find_short_successor(&[0xff, 0x01, 0x55]));
    }

    #[test]
    fn separator_preserves_trailer() {
        let last = InternalKey::new(*b"abcdef", 42, ValueType::Tombstone);
        let sep = separator(&BytewiseComparator, &last, b"abzz");

        assert_eq!(42, sep.seqno);
        assert_eq!(ValueType::Tombstone, sep.value_type);
        assert!(last <= sep);
    }

    #[test]
    fn separator_orders_between_blocks() {
        let last = InternalKey::new(*b"abcdef", 1, ValueType::Value);
        let sep = separator(&BytewiseComparator, &last, b"abzz");
        let next = InternalKey::new(*b"abzz", u64::MAX >> 8, ValueType::Value);

        assert!(last <= sep);
        assert!(sep < next);
    }
}
