// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::SeqNo;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

/// The set of sequence numbers pinned by open snapshots
///
/// While a snapshot with sequence `s` is alive, compaction must keep
/// the newest entry at or below `s` for every key, so reads at `s`
/// stay stable.
#[derive(Default)]
pub struct SnapshotList {
    /// seqno -> number of open snapshots at that seqno
    inner: Mutex<BTreeMap<SeqNo, usize>>,
}

impl SnapshotList {
    /// Registers a new snapshot at the given sequence number.
    pub fn acquire(self: &Arc<Self>, seqno: SeqNo) -> Snapshot {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        *inner.entry(seqno).or_insert(0) += 1;

        Snapshot {
            inner: Arc::new(SnapshotInner {
                seqno,
                list: Arc::downgrade(self),
            }),
        }
    }

    /// The smallest pinned sequence number, if any snapshot is open.
    #[must_use]
    pub fn smallest(&self) -> Option<SeqNo> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let inner = self.inner.lock().expect("lock is poisoned");

        inner.keys().next().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let inner = self.inner.lock().expect("lock is poisoned");

        inner.is_empty()
    }

    fn release(&self, seqno: SeqNo) {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if let Some(count) = inner.get_mut(&seqno) {
            *count -= 1;

            if *count == 0 {
                inner.remove(&seqno);
            }
        }
    }
}

struct SnapshotInner {
    seqno: SeqNo,
    list: Weak<SnapshotList>,
}

impl Drop for SnapshotInner {
    fn drop(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.release(self.seqno);
        }
    }
}

/// A consistent point-in-time view of the database
///
/// Reads through a snapshot observe exactly the writes with a
/// sequence number at or below the snapshot's. Dropping the last
/// clone releases it.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    /// The sequence number this snapshot pins.
    #[must_use]
    pub fn sequence(&self) -> SeqNo {
        self.inner.seqno
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Snapshot({})", self.sequence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn snapshot_list_tracks_smallest() {
        let list = Arc::new(SnapshotList::default());
        assert!(list.smallest().is_none());

        let s10 = list.acquire(10);
        let s5 = list.acquire(5);
        let s5b = list.acquire(5);

        assert_eq!(Some(5), list.smallest());

        drop(s5);
        assert_eq!(Some(5), list.smallest(), "second handle still pins 5");

        drop(s5b);
        assert_eq!(Some(10), list.smallest());

        drop(s10);
        assert!(list.is_empty());
    }

    #[test]
    fn snapshot_clone_shares_pin() {
        let list = Arc::new(SnapshotList::default());

        let snapshot = list.acquire(7);
        let clone = snapshot.clone();

        drop(snapshot);
        assert_eq!(Some(7), list.smallest());

        drop(clone);
        assert!(list.is_empty());
    }
}
