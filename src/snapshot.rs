//! Snapshot bookkeeping.
//!
//! A snapshot pins a sequence number: readers at snapshot `S` observe
//! entries with `seq <= S`, and compactions may only drop a shadowed entry
//! when no snapshot separates it from its shadower. The list tracks open
//! snapshot seqs with counts; the `Snapshot` handle itself lives in the
//! `db` module so it can carry version references.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Open snapshot sequence numbers, reference-counted per seq.
#[derive(Default)]
pub struct SnapshotList {
    inner: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, seq: u64) {
        *self.inner.lock().unwrap().entry(seq).or_insert(0) += 1;
    }

    pub fn release(&self, seq: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                inner.remove(&seq);
            }
        }
    }

    /// Distinct open snapshot seqs, ascending.
    pub fn seqs(&self) -> Vec<u64> {
        self.inner.lock().unwrap().keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn earliest(&self) -> Option<u64> {
        self.inner.lock().unwrap().keys().next().copied()
    }
}

/// The snapshot stripe of `seq`: the number of open snapshots strictly
/// below it. Two entries fall in the same stripe exactly when no snapshot
/// sits between them, which is when the newer may shadow the older during
/// compaction.
pub fn stripe_of(seq: u64, snapshots: &[u64]) -> usize {
    snapshots.partition_point(|s| *s < seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_counts_and_releases() {
        let list = SnapshotList::new();
        assert!(list.is_empty());

        list.acquire(5);
        list.acquire(5);
        list.acquire(9);
        assert_eq!(list.seqs(), vec![5, 9]);
        assert_eq!(list.earliest(), Some(5));

        list.release(5);
        assert_eq!(list.seqs(), vec![5, 9]);
        list.release(5);
        assert_eq!(list.seqs(), vec![9]);
        list.release(9);
        assert!(list.is_empty());
    }

    #[test]
    fn stripes_split_at_snapshots() {
        let snapshots = [10, 20];
        // Everything at or below the earliest snapshot shares stripe 0.
        assert_eq!(stripe_of(3, &snapshots), 0);
        assert_eq!(stripe_of(10, &snapshots), 0);
        // Between the snapshots.
        assert_eq!(stripe_of(11, &snapshots), 1);
        assert_eq!(stripe_of(20, &snapshots), 1);
        // Above every snapshot.
        assert_eq!(stripe_of(21, &snapshots), 2);

        // A snapshot at 10 separates a write at 10 from one at 11: the
        // snapshot still needs the older value.
        assert_ne!(stripe_of(10, &snapshots), stripe_of(11, &snapshots));
        // No snapshot between 11 and 19: same stripe.
        assert_eq!(stripe_of(11, &snapshots), stripe_of(19, &snapshots));
    }
}
