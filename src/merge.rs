// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{value::SeqNo, InternalValue, UserKey};
use double_ended_peekable::{DoubleEndedPeekable, DoubleEndedPeekableExt};

pub type BoxedIterator<'a> = Box<dyn DoubleEndedIterator<Item = crate::Result<InternalValue>> + 'a>;

/// Merges multiple iterators
///
/// This iterator can iterate through N iterators simultaneously in order
/// This is achieved by advancing the iterators that yield the lowest/highest item
/// and merging using a simple k-way merge algorithm.
///
/// If multiple iterators yield the same key value, the freshest one (highest seqno) will be picked.
#[allow(clippy::module_name_repetitions)]
pub struct MergeIterator<'a> {
    iterators: Vec<DoubleEndedPeekable<BoxedIterator<'a>>>,
    evict_old_versions: bool,
    seqno: Option<SeqNo>,
}

impl<'a> MergeIterator<'a> {
    /// Initializes a new merge iterator
    #[must_use]
    pub fn new(iterators: Vec<BoxedIterator<'a>>) -> Self {
        let iterators = iterators
            .into_iter()
            .map(DoubleEndedPeekableExt::double_ended_peekable)
            .collect::<Vec<_>>();

        Self {
            iterators,
            evict_old_versions: false,
            seqno: None,
        }
    }

    /// Evict old versions by skipping over them
    #[must_use]
    pub fn evict_old_versions(mut self, v: bool) -> Self {
        self.evict_old_versions = v;
        self
    }

    /// Only items with a sequence number at or below `seqno` are emitted.
    #[must_use]
    pub fn snapshot_seqno(mut self, seqno: SeqNo) -> Self {
        self.seqno = Some(seqno);
        self
    }

    fn is_visible(&self, item: &InternalValue) -> bool {
        match self.seqno {
            Some(seqno) => item.key.seqno <= seqno,
            None => true,
        }
    }

    /// Consumes all remaining versions of the given key from every child.
    fn drain_key_min(&mut self, key: &UserKey) -> crate::Result<()> {
        for iter in &mut self.iterators {
            'inner: loop {
                match iter.peek() {
                    Some(Ok(item)) => {
                        if &item.key.user_key == key {
                            // Consume the stale version
                            if let Some(Err(e)) = iter.next() {
                                return Err(e);
                            }
                        } else {
                            // Reached the next key, go to next iterator
                            break 'inner;
                        }
                    }
                    Some(Err(_)) => {
                        if let Some(Err(e)) = iter.next() {
                            return Err(e);
                        }
                        break 'inner;
                    }
                    None => {
                        // Iterator is empty, go to next
                        break 'inner;
                    }
                }
            }
        }

        Ok(())
    }

    /// Index of a child whose head is an error, if any.
    fn find_err_front(&mut self) -> Option<usize> {
        self.iterators
            .iter_mut()
            .map(DoubleEndedPeekable::peek)
            .enumerate()
            .find_map(|(idx, head)| match head {
                Some(Err(_)) => Some(idx),
                _ => None,
            })
    }

    fn find_err_back(&mut self) -> Option<usize> {
        self.iterators
            .iter_mut()
            .map(DoubleEndedPeekable::peek_back)
            .enumerate()
            .find_map(|(idx, head)| match head {
                Some(Err(_)) => Some(idx),
                _ => None,
            })
    }

    fn get_min(&mut self) -> Option<crate::Result<InternalValue>> {
        if let Some(idx) = self.find_err_front() {
            return self
                .iterators
                .get_mut(idx)
                .and_then(DoubleEndedPeekable::next);
        }

        let mut min: Option<(usize, &InternalValue)> = None;

        for (idx, head) in self.iterators.iter_mut().map(|x| x.peek()).enumerate() {
            if let Some(Ok(item)) = head {
                match min {
                    Some((_, min_item)) if item >= min_item => {}
                    _ => min = Some((idx, item)),
                }
            }
        }

        let (idx, _) = min?;

        self.iterators
            .get_mut(idx)
            .and_then(DoubleEndedPeekable::next)
    }

    fn get_max(&mut self) -> Option<crate::Result<InternalValue>> {
        if let Some(idx) = self.find_err_back() {
            return self
                .iterators
                .get_mut(idx)
                .and_then(DoubleEndedPeekable::next_back);
        }

        let mut max: Option<(usize, &InternalValue)> = None;

        for (idx, head) in self.iterators.iter_mut().map(|x| x.peek_back()).enumerate() {
            if let Some(Ok(item)) = head {
                match max {
                    Some((_, max_item)) if item <= max_item => {}
                    _ => max = Some((idx, item)),
                }
            }
        }

        let (idx, _) = max?;

        self.iterators
            .get_mut(idx)
            .and_then(DoubleEndedPeekable::next_back)
    }

    /// User key of the item that `get_max` would yield next.
    fn peek_max_user_key(&mut self) -> Option<crate::Result<UserKey>> {
        if self.find_err_back().is_some() {
            return match self.get_max() {
                Some(Err(e)) => Some(Err(e)),
                _ => None,
            };
        }

        let mut max: Option<&InternalValue> = None;

        for head in self.iterators.iter_mut().map(|x| x.peek_back()) {
            if let Some(Ok(item)) = head {
                match max {
                    Some(max_item) if item <= max_item => {}
                    _ => max = Some(item),
                }
            }
        }

        max.map(|item| Ok(item.key.user_key.clone()))
    }
}

impl<'a> Iterator for MergeIterator<'a> {
    type Item = crate::Result<InternalValue>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.get_min()? {
                Ok(min_item) => {
                    if !self.is_visible(&min_item) {
                        // Filter out seqnos that are too high
                        continue;
                    }

                    // As long as items beneath this one share the key,
                    // they are shadowed and can be skipped
                    if self.evict_old_versions {
                        if let Err(e) = self.drain_key_min(&min_item.key.user_key) {
                            return Some(Err(e));
                        };
                    }

                    return Some(Ok(min_item));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<'a> DoubleEndedIterator for MergeIterator<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        loop {
            match self.get_max()? {
                Ok(max_item) => {
                    let mut head = max_item;

                    if self.evict_old_versions {
                        // Iterating backwards, newer versions of the same
                        // key come afterwards, so keep replacing the head
                        // while it stays visible
                        'inner: loop {
                            let same_key = match self.peek_max_user_key() {
                                Some(Ok(next_key)) => next_key == head.key.user_key,
                                Some(Err(e)) => return Some(Err(e)),
                                None => false,
                            };

                            if !same_key {
                                break 'inner;
                            }

                            let next = match self.get_max() {
                                Some(Ok(next)) => next,
                                Some(Err(e)) => return Some(Err(e)),
                                None => break 'inner,
                            };

                            if self.is_visible(&next) {
                                head = next;
                            }
                        }
                    }

                    if !self.is_visible(&head) {
                        // Filter out seqnos that are too high
                        continue;
                    }

                    return Some(Ok(head));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueType;
    use test_log::test;

    macro_rules! iter_closed {
        ($iter:expr) => {
            assert!($iter.next().is_none(), "iterator should be closed (done)");
            assert!(
                $iter.next_back().is_none(),
                "iterator should be closed (done)"
            );
        };
    }

    fn value(key: &[u8], value: &[u8], seqno: SeqNo, value_type: ValueType) -> InternalValue {
        InternalValue::from_components(key, value, seqno, value_type)
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_no_evict_simple_forward() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"old", 0, ValueType::Value),
            value(b"b", b"old", 0, ValueType::Value),
            value(b"c", b"old", 0, ValueType::Value),
        ];

        let vec1 = [
            value(b"a", b"new", 1, ValueType::Value),
            value(b"b", b"new", 1, ValueType::Value),
            value(b"c", b"new", 1, ValueType::Value),
        ];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let mut iter = MergeIterator::new(vec![iter0, iter1]).evict_old_versions(false);

        assert_eq!(value(b"a", b"new", 1, ValueType::Value), iter.next().unwrap()?);
        assert_eq!(value(b"a", b"old", 0, ValueType::Value), iter.next().unwrap()?);
        assert_eq!(value(b"b", b"new", 1, ValueType::Value), iter.next().unwrap()?);
        assert_eq!(value(b"b", b"old", 0, ValueType::Value), iter.next().unwrap()?);
        assert_eq!(value(b"c", b"new", 1, ValueType::Value), iter.next().unwrap()?);
        assert_eq!(value(b"c", b"old", 0, ValueType::Value), iter.next().unwrap()?);

        iter_closed!(iter);

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_evict_simple_forward() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"old", 0, ValueType::Value),
            value(b"b", b"old", 0, ValueType::Value),
            value(b"c", b"old", 0, ValueType::Value),
        ];

        let vec1 = [
            value(b"a", b"new", 1, ValueType::Value),
            value(b"b", b"new", 1, ValueType::Value),
            value(b"c", b"new", 1, ValueType::Value),
        ];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let mut iter = MergeIterator::new(vec![iter0, iter1]).evict_old_versions(true);

        assert_eq!(value(b"a", b"new", 1, ValueType::Value), iter.next().unwrap()?);
        assert_eq!(value(b"b", b"new", 1, ValueType::Value), iter.next().unwrap()?);
        assert_eq!(value(b"c", b"new", 1, ValueType::Value), iter.next().unwrap()?);

        iter_closed!(iter);

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_evict_simple_reverse() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"old", 0, ValueType::Value),
            value(b"b", b"old", 0, ValueType::Value),
            value(b"c", b"old", 0, ValueType::Value),
        ];

        let vec1 = [
            value(b"a", b"new", 1, ValueType::Value),
            value(b"b", b"new", 1, ValueType::Value),
            value(b"c", b"new", 1, ValueType::Value),
        ];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let mut iter = MergeIterator::new(vec![iter0, iter1]).evict_old_versions(true);

        assert_eq!(
            value(b"c", b"new", 1, ValueType::Value),
            iter.next_back().unwrap()?,
        );
        assert_eq!(
            value(b"b", b"new", 1, ValueType::Value),
            iter.next_back().unwrap()?,
        );
        assert_eq!(
            value(b"a", b"new", 1, ValueType::Value),
            iter.next_back().unwrap()?,
        );

        iter_closed!(iter);

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_snapshot_forward() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"", 3, ValueType::Value),
            value(b"a", b"", 2, ValueType::Value),
            value(b"a", b"", 1, ValueType::Value),
            value(b"a", b"", 0, ValueType::Value),
        ];

        {
            let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));

            let mut iter = MergeIterator::new(vec![iter0])
                .snapshot_seqno(0)
                .evict_old_versions(true);

            assert_eq!(value(b"a", b"", 0, ValueType::Value), iter.next().unwrap()?);
            iter_closed!(iter);
        }

        {
            let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));

            let mut iter = MergeIterator::new(vec![iter0])
                .snapshot_seqno(2)
                .evict_old_versions(true);

            assert_eq!(value(b"a", b"", 2, ValueType::Value), iter.next().unwrap()?);
            iter_closed!(iter);
        }

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_snapshot_reverse() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"", 3, ValueType::Value),
            value(b"a", b"", 2, ValueType::Value),
            value(b"a", b"", 1, ValueType::Value),
            value(b"a", b"", 0, ValueType::Value),
        ];

        {
            let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));

            let mut iter = MergeIterator::new(vec![iter0])
                .snapshot_seqno(1)
                .evict_old_versions(true);

            assert_eq!(
                value(b"a", b"", 1, ValueType::Value),
                iter.next_back().unwrap()?,
            );
            iter_closed!(iter);
        }

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_evict_tombstone_forward() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"old", 2, ValueType::Value),
            value(b"a", b"old", 1, ValueType::Value),
            value(b"a", b"old", 0, ValueType::Value),
        ];

        let vec1 = [value(b"a", b"", 3, ValueType::Tombstone)];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let mut iter = MergeIterator::new(vec![iter0, iter1]).evict_old_versions(true);

        assert_eq!(
            value(b"a", b"", 3, ValueType::Tombstone),
            iter.next().unwrap()?,
        );

        iter_closed!(iter);

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_evict_tombstone_reverse() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"old", 2, ValueType::Value),
            value(b"a", b"old", 1, ValueType::Value),
            value(b"a", b"old", 0, ValueType::Value),
        ];

        let vec1 = [value(b"a", b"", 3, ValueType::Tombstone)];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let mut iter = MergeIterator::new(vec![iter0, iter1]).evict_old_versions(true);

        assert_eq!(
            value(b"a", b"", 3, ValueType::Tombstone),
            iter.next_back().unwrap()?,
        );

        iter_closed!(iter);

        Ok(())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn merge_ping_pong() -> crate::Result<()> {
        let vec0 = [
            value(b"a", b"", 0, ValueType::Value),
            value(b"b", b"", 0, ValueType::Value),
            value(b"c", b"", 0, ValueType::Value),
        ];

        let vec1 = [
            value(b"d", b"", 0, ValueType::Value),
            value(b"e", b"", 0, ValueType::Value),
            value(b"f", b"", 0, ValueType::Value),
        ];

        let iter0: BoxedIterator = Box::new(vec0.iter().cloned().map(Ok));
        let iter1: BoxedIterator = Box::new(vec1.iter().cloned().map(Ok));

        let mut iter = MergeIterator::new(vec![iter0, iter1]);

        assert_eq!(b"a", &*iter.next().unwrap()?.key.user_key);
        assert_eq!(b"f", &*iter.next_back().unwrap()?.key.user_key);
        assert_eq!(b"b", &*iter.next().unwrap()?.key.user_key);
        assert_eq!(b"e", &*iter.next_back().unwrap()?.key.user_key);
        assert_eq!(b"c", &*iter.next().unwrap()?.key.user_key);
        assert_eq!(b"d", &*iter.next_back().unwrap()?.key.user_key);

        iter_closed!(iter);

        Ok(())
    }

    #[test]
    fn merge_non_overlapping() -> crate::Result<()> {
        let iter0 = (0u64..5).map(|x| value(&x.to_be_bytes(), b"old", 0, ValueType::Value));
        let iter1 = (5u64..10).map(|x| value(&x.to_be_bytes(), b"new", 3, ValueType::Value));
        let iter2 = (10u64..15).map(|x| value(&x.to_be_bytes(), b"asd", 1, ValueType::Tombstone));
        let iter3 = (15u64..20).map(|x| value(&x.to_be_bytes(), b"qwe", 2, ValueType::Tombstone));

        let iter0: BoxedIterator = Box::new(iter0.map(Ok));
        let iter1: BoxedIterator = Box::new(iter1.map(Ok));
        let iter2: BoxedIterator = Box::new(iter2.map(Ok));
        let iter3: BoxedIterator = Box::new(iter3.map(Ok));

        let merge_iter = MergeIterator::new(vec![iter0, iter1, iter2, iter3]);

        for (idx, item) in merge_iter.enumerate() {
            let item = item?;
            assert_eq!(item.key.user_key, (idx as u64).to_be_bytes());
        }

        Ok(())
    }
}
