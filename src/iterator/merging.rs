//! N-way merging iterator.
//!
//! Maintains a min-heap for forward iteration and a max-heap for backward
//! iteration over its child iterators; reversing direction re-seeks every
//! child around the current key. Children positioned on equal internal keys
//! order by source index, newer sources first.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;

use super::{BoxedIterator, InternalIterator};
use crate::comparator::Comparator;
use crate::error::Result;
use crate::key::InternalKey;

#[derive(PartialEq, Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

struct Child<'a> {
    cmp: &'static Comparator,
    iter: BoxedIterator<'a>,
    /// Source index; lower indices are newer sources and win ties.
    idx: usize,
}

impl PartialEq for Child<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Child<'_> {}

impl PartialOrd for Child<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Child<'_> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Only valid children live in the heaps.
        self.iter
            .key()
            .cmp_with(self.cmp, other.iter.key())
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

/// Merges N point iterators into one stream of internal keys in
/// `(user key asc, trailer desc)` order.
pub struct MergingIter<'a> {
    cmp: &'static Comparator,
    direction: Direction,
    /// Children at an invalid position.
    parked: Vec<Child<'a>>,
    min_heap: BinaryHeap<Reverse<Child<'a>>>,
    max_heap: BinaryHeap<Child<'a>>,
}

impl<'a> MergingIter<'a> {
    pub fn new(cmp: &'static Comparator, iters: Vec<BoxedIterator<'a>>) -> Self {
        let parked = iters
            .into_iter()
            .enumerate()
            .map(|(idx, iter)| Child { cmp, iter, idx })
            .collect();
        Self {
            cmp,
            direction: Direction::Forward,
            parked,
            min_heap: BinaryHeap::new(),
            max_heap: BinaryHeap::new(),
        }
    }

    fn drain_children(&mut self) -> Vec<Child<'a>> {
        let mut children = std::mem::take(&mut self.parked);
        children.extend(self.min_heap.drain().map(|r| r.0));
        children.extend(self.max_heap.drain());
        children
    }

    fn restack(&mut self, children: Vec<Child<'a>>, direction: Direction) {
        self.direction = direction;
        for child in children {
            if child.iter.valid() {
                match direction {
                    Direction::Forward => self.min_heap.push(Reverse(child)),
                    Direction::Backward => self.max_heap.push(child),
                }
            } else {
                self.parked.push(child);
            }
        }
    }

    /// Re-seeks every child so that forward iteration resumes strictly
    /// after `pivot`.
    fn reverse_to_forward(&mut self, pivot: &InternalKey) -> Result<()> {
        let cmp = self.cmp;
        let mut children = self.drain_children();
        for child in children.iter_mut() {
            child.iter.seek_ge(&pivot.user_key)?;
            while child.iter.valid()
                && child.iter.key().cmp_with(cmp, pivot) != CmpOrdering::Greater
            {
                child.iter.next()?;
            }
        }
        self.restack(children, Direction::Forward);
        Ok(())
    }

    /// Re-seeks every child so that backward iteration resumes strictly
    /// before `pivot`.
    fn reverse_to_backward(&mut self, pivot: &InternalKey) -> Result<()> {
        let cmp = self.cmp;
        let mut children = self.drain_children();
        for child in children.iter_mut() {
            child.iter.seek_ge(&pivot.user_key)?;
            if !child.iter.valid() {
                // Every entry in this child precedes the pivot's user key.
                child.iter.last()?;
            }
            while child.iter.valid()
                && child.iter.key().cmp_with(cmp, pivot) != CmpOrdering::Less
            {
                child.iter.prev()?;
            }
        }
        self.restack(children, Direction::Backward);
        Ok(())
    }
}

impl InternalIterator for MergingIter<'_> {
    fn first(&mut self) -> Result<()> {
        let mut children = self.drain_children();
        for child in children.iter_mut() {
            child.iter.first()?;
        }
        self.restack(children, Direction::Forward);
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        let mut children = self.drain_children();
        for child in children.iter_mut() {
            child.iter.last()?;
        }
        self.restack(children, Direction::Backward);
        Ok(())
    }

    fn seek_ge(&mut self, user_key: &[u8]) -> Result<()> {
        let mut children = self.drain_children();
        for child in children.iter_mut() {
            child.iter.seek_ge(user_key)?;
        }
        self.restack(children, Direction::Forward);
        Ok(())
    }

    fn seek_lt(&mut self, user_key: &[u8]) -> Result<()> {
        let mut children = self.drain_children();
        for child in children.iter_mut() {
            child.iter.seek_lt(user_key)?;
        }
        self.restack(children, Direction::Backward);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        assert!(self.valid(), "next on invalid iterator");
        if self.direction == Direction::Backward {
            let pivot = self.key().clone();
            return self.reverse_to_forward(&pivot);
        }
        let Reverse(mut child) = self.min_heap.pop().expect("forward heap is non-empty");
        child.iter.next()?;
        if child.iter.valid() {
            self.min_heap.push(Reverse(child));
        } else {
            self.parked.push(child);
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        assert!(self.valid(), "prev on invalid iterator");
        if self.direction == Direction::Forward {
            let pivot = self.key().clone();
            return self.reverse_to_backward(&pivot);
        }
        let mut child = self.max_heap.pop().expect("backward heap is non-empty");
        child.iter.prev()?;
        if child.iter.valid() {
            self.max_heap.push(child);
        } else {
            self.parked.push(child);
        }
        Ok(())
    }

    fn valid(&self) -> bool {
        match self.direction {
            Direction::Forward => !self.min_heap.is_empty(),
            Direction::Backward => !self.max_heap.is_empty(),
        }
    }

    fn key(&self) -> &InternalKey {
        match self.direction {
            Direction::Forward => self.min_heap.peek().expect("valid iterator").0.iter.key(),
            Direction::Backward => self.max_heap.peek().expect("valid iterator").iter.key(),
        }
    }

    fn value(&self) -> &[u8] {
        match self.direction {
            Direction::Forward => self.min_heap.peek().expect("valid iterator").0.iter.value(),
            Direction::Backward => self.max_heap.peek().expect("valid iterator").iter.value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::batch::Batch;
    use crate::comparator::BYTEWISE;
    use crate::key::KeyKind;
    use crate::memtable::Memtable;

    fn memtable_with(pairs: &[(&[u8], &[u8])], base_seq: u64) -> Arc<Memtable> {
        let mem = Arc::new(Memtable::new(&BYTEWISE, 1 << 20, 1));
        let mut batch = Batch::new();
        for (k, v) in pairs {
            batch.set(k, v).unwrap();
        }
        mem.add(&batch, base_seq).unwrap();
        mem
    }

    fn merging<'a>(mems: &[Arc<Memtable>]) -> MergingIter<'a> {
        let iters: Vec<BoxedIterator<'a>> = mems
            .iter()
            .map(|m| Box::new(m.point_iter()) as BoxedIterator<'a>)
            .collect();
        MergingIter::new(&BYTEWISE, iters)
    }

    fn collect_forward(iter: &mut MergingIter) -> Vec<(Vec<u8>, u64)> {
        let mut out = Vec::new();
        iter.first().unwrap();
        while iter.valid() {
            out.push((iter.key().user_key.clone(), iter.key().seq()));
            iter.next().unwrap();
        }
        out
    }

    #[test]
    fn merges_sources_in_key_order() {
        let m1 = memtable_with(&[(b"a", b"1"), (b"d", b"4")], 10);
        let m2 = memtable_with(&[(b"b", b"2"), (b"e", b"5")], 20);
        let mut iter = merging(&[m1, m2]);

        let keys = collect_forward(&mut iter);
        assert_eq!(
            keys,
            vec![
                (b"a".to_vec(), 10),
                (b"b".to_vec(), 20),
                (b"d".to_vec(), 11),
                (b"e".to_vec(), 21)
            ]
        );
    }

    #[test]
    fn same_user_key_newest_first() {
        let m1 = memtable_with(&[(b"k", b"old")], 5);
        let m2 = memtable_with(&[(b"k", b"new")], 9);
        let mut iter = merging(&[m1, m2]);

        iter.first().unwrap();
        assert_eq!(iter.key().seq(), 9);
        assert_eq!(iter.value(), b"new");
        iter.next().unwrap();
        assert_eq!(iter.key().seq(), 5);
        iter.next().unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn seek_and_reverse_direction() {
        let m1 = memtable_with(&[(b"a", b"1"), (b"c", b"3")], 10);
        let m2 = memtable_with(&[(b"b", b"2"), (b"d", b"4")], 20);
        let mut iter = merging(&[m1, m2]);

        iter.seek_ge(b"b").unwrap();
        assert_eq!(iter.key().user_key, b"b");
        iter.next().unwrap();
        assert_eq!(iter.key().user_key, b"c");

        // Reverse: prev from c lands on b, then a.
        iter.prev().unwrap();
        assert_eq!(iter.key().user_key, b"b");
        iter.prev().unwrap();
        assert_eq!(iter.key().user_key, b"a");
        iter.prev().unwrap();
        assert!(!iter.valid());

        // Forward again from scratch.
        iter.seek_lt(b"d").unwrap();
        assert_eq!(iter.key().user_key, b"c");
        iter.next().unwrap();
        assert_eq!(iter.key().user_key, b"d");
    }

    #[test]
    fn reversal_covers_all_versions_of_a_key() {
        // Versions of "k" split across sources; prev must revisit them in
        // reverse trailer order.
        let m1 = memtable_with(&[(b"k", b"v1")], 5);
        let m2 = memtable_with(&[(b"k", b"v2")], 9);
        let m3 = memtable_with(&[(b"z", b"zz")], 1);
        let mut iter = merging(&[m1, m2, m3]);

        iter.seek_ge(b"z").unwrap();
        assert_eq!(iter.key().user_key, b"z");
        // Backward over both versions of k: oldest is closest to z.
        iter.prev().unwrap();
        assert_eq!((iter.key().user_key.clone(), iter.key().seq()), (b"k".to_vec(), 5));
        iter.prev().unwrap();
        assert_eq!((iter.key().user_key.clone(), iter.key().seq()), (b"k".to_vec(), 9));
        iter.prev().unwrap();
        assert!(!iter.valid());

        // And forward again from an absolute position.
        iter.seek_ge(b"k").unwrap();
        assert_eq!((iter.key().user_key.clone(), iter.key().seq()), (b"k".to_vec(), 9));
        iter.next().unwrap();
        assert_eq!((iter.key().user_key.clone(), iter.key().seq()), (b"k".to_vec(), 5));
        iter.next().unwrap();
        assert_eq!(iter.key().user_key, b"z");
    }

    #[test]
    fn delete_and_set_order_at_same_key() {
        let m1 = memtable_with(&[(b"k", b"v")], 3);
        let m2 = Arc::new(Memtable::new(&BYTEWISE, 1 << 20, 2));
        let mut batch = Batch::new();
        batch.delete(b"k").unwrap();
        m2.add(&batch, 8).unwrap();

        let mut iter = merging(&[m1, m2]);
        iter.first().unwrap();
        assert_eq!(iter.key().kind(), KeyKind::Delete);
        assert_eq!(iter.key().seq(), 8);
        iter.next().unwrap();
        assert_eq!(iter.key().kind(), KeyKind::Set);
    }
}
