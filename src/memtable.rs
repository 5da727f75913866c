//! Memtables.
//!
//! A memtable is a concurrent ordered map keyed by internal key with a
//! fixed byte budget, built on `crossbeam_skiplist::SkipMap`: lock-free
//! publication, concurrent readers that never block writers, ordered range
//! iteration. Point records, range tombstones, and range keys live in three
//! separate skiplists sharing one budget.
//!
//! Lifecycle: created empty → active → frozen (queued for flush) →
//! flushed → released. Once published a record is immutable until the
//! memtable is released; freezing only stops further writes.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::batch::{decode_range_key_payload, Batch};
use crate::comparator::Comparator;
use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::key::{InternalKey, KeyKind};
use crate::keyspan::{fragment_all, Span, SpanKey};
use crate::Error;

/// An internal key ordered by a user-supplied comparator, usable as an
/// ordered-container key. Carries the comparator so `Ord` can consult it.
#[derive(Clone)]
pub struct MapKey {
    cmp: &'static Comparator,
    key: InternalKey,
}

impl MapKey {
    pub fn new(cmp: &'static Comparator, key: InternalKey) -> Self {
        Self { cmp, key }
    }

    pub fn key(&self) -> &InternalKey {
        &self.key
    }
}

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for MapKey {}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key.cmp_with(self.cmp, &other.key)
    }
}

/// Value payload for range records: the exclusive end plus the suffix and
/// value for range-key sets.
#[derive(Debug, Clone)]
struct SpanRec {
    end: Vec<u8>,
    suffix: Vec<u8>,
    value: Vec<u8>,
}

/// In-memory sorted table over internal keys with a byte budget.
pub struct Memtable {
    cmp: &'static Comparator,
    points: SkipMap<MapKey, Vec<u8>>,
    rangedels: SkipMap<MapKey, SpanRec>,
    rangekeys: SkipMap<MapKey, SpanRec>,
    size: AtomicUsize,
    budget: usize,
    frozen: AtomicBool,
    max_seq: AtomicU64,
    /// WAL segment paired with this memtable.
    log_num: u64,
}

impl Memtable {
    pub fn new(cmp: &'static Comparator, budget: usize, log_num: u64) -> Self {
        Self {
            cmp,
            points: SkipMap::new(),
            rangedels: SkipMap::new(),
            rangekeys: SkipMap::new(),
            size: AtomicUsize::new(0),
            budget,
            frozen: AtomicBool::new(false),
            max_seq: AtomicU64::new(0),
            log_num,
        }
    }

    pub fn log_num(&self) -> u64 {
        self.log_num
    }

    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.rangedels.is_empty() && self.rangekeys.is_empty()
    }

    /// Largest sequence number published into this memtable.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::SeqCst)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Stops further writes. Fails if already frozen.
    pub fn mark_frozen(&self) -> Result<()> {
        if self.frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Reserves `needed` bytes against the budget. The first reservation
    /// always succeeds so a batch larger than the whole budget still lands
    /// in an empty memtable.
    fn reserve(&self, needed: usize) -> Result<()> {
        loop {
            let cur = self.size.load(Ordering::SeqCst);
            if cur != 0 && cur + needed > self.budget {
                return Err(Error::MemtableFull);
            }
            if self
                .size
                .compare_exchange(cur, cur + needed, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Inserts every record of `batch` with sequence numbers
    /// `base_seq + offset`. Fails with `MemtableFull` before publishing
    /// anything if the batch does not fit, leaving the memtable intact.
    pub fn add(&self, batch: &Batch, base_seq: u64) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::ReadOnly);
        }
        self.reserve(batch.memtable_size())?;

        let mut max_seq = 0u64;
        for rec in batch.records() {
            let seq = base_seq + rec.seq_offset as u64;
            let ikey = InternalKey::new(rec.key, seq, rec.kind);
            match rec.kind {
                KeyKind::Set
                | KeyKind::SetWithDelete
                | KeyKind::Merge
                | KeyKind::Delete
                | KeyKind::SingleDelete
                | KeyKind::DeleteSized => {
                    self.points
                        .insert(MapKey::new(self.cmp, ikey), rec.value.to_vec());
                }
                KeyKind::RangeDelete => {
                    self.rangedels.insert(
                        MapKey::new(self.cmp, ikey),
                        SpanRec {
                            end: rec.value.to_vec(),
                            suffix: Vec::new(),
                            value: Vec::new(),
                        },
                    );
                }
                KeyKind::RangeKeySet | KeyKind::RangeKeyUnset | KeyKind::RangeKeyDelete => {
                    let (end, suffix, value) = decode_range_key_payload(rec.kind, rec.value)?;
                    self.rangekeys
                        .insert(MapKey::new(self.cmp, ikey), SpanRec { end, suffix, value });
                }
                KeyKind::LogData | KeyKind::IngestSst => {}
            }
            if rec.kind != KeyKind::LogData {
                max_seq = max_seq.max(seq);
            }
        }
        self.max_seq.fetch_max(max_seq, Ordering::SeqCst);
        Ok(())
    }

    /// The newest point record for `user_key` with seq `<= seq_ceiling`, if
    /// any. Range tombstones are not consulted; that is the reader stack's
    /// job.
    pub fn get(&self, user_key: &[u8], seq_ceiling: u64) -> Option<(KeyKind, Vec<u8>)> {
        let bound = MapKey::new(self.cmp, InternalKey::range_end_sentinel(user_key));
        for entry in self.points.range(bound..) {
            let key = entry.key().key();
            if self.cmp.cmp(&key.user_key, user_key) != CmpOrdering::Equal {
                return None;
            }
            if key.seq() <= seq_ceiling {
                return Some((key.kind(), entry.value().clone()));
            }
        }
        None
    }

    /// An iterator over point records.
    pub fn point_iter(self: &Arc<Self>) -> MemtableIter {
        MemtableIter {
            mem: Arc::clone(self),
            current: None,
        }
    }

    /// Fragmented range tombstones.
    pub fn rangedel_iter(&self) -> Vec<Span> {
        let spans = self
            .rangedels
            .iter()
            .map(|e| {
                let key = e.key().key();
                Span::new(
                    key.user_key.clone(),
                    e.value().end.clone(),
                    vec![SpanKey::new(key.trailer, Vec::new(), Vec::new())],
                )
            })
            .collect();
        fragment_all(self.cmp, spans)
    }

    /// Fragmented range-key spans.
    pub fn rangekey_iter(&self) -> Vec<Span> {
        let spans = self
            .rangekeys
            .iter()
            .map(|e| {
                let key = e.key().key();
                let rec = e.value();
                Span::new(
                    key.user_key.clone(),
                    rec.end.clone(),
                    vec![SpanKey::new(key.trailer, rec.suffix.clone(), rec.value.clone())],
                )
            })
            .collect();
        fragment_all(self.cmp, spans)
    }

    /// Whether any record in the memtable intersects the user-key range
    /// `[start, end]` (inclusive bounds).
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        let bound = MapKey::new(self.cmp, InternalKey::range_end_sentinel(start));
        if let Some(entry) = self.points.range(bound..).next() {
            if self.cmp.cmp(&entry.key().key().user_key, end) != CmpOrdering::Greater {
                return true;
            }
        }
        let span_overlaps = |spans: &SkipMap<MapKey, SpanRec>| {
            spans.iter().any(|e| {
                self.cmp.cmp(&e.key().key().user_key, end) != CmpOrdering::Greater
                    && self.cmp.cmp(start, &e.value().end) == CmpOrdering::Less
            })
        };
        span_overlaps(&self.rangedels) || span_overlaps(&self.rangekeys)
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("log_num", &self.log_num)
            .field("size", &self.approximate_size())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}

/// Point iterator over a memtable. Steps re-enter the skiplist from the
/// current position, so the iterator stays valid across concurrent inserts
/// and holds no borrow of the map.
pub struct MemtableIter {
    mem: Arc<Memtable>,
    current: Option<(InternalKey, Vec<u8>)>,
}

impl MemtableIter {
    fn bound(&self, key: InternalKey) -> MapKey {
        MapKey::new(self.mem.cmp, key)
    }
}

impl InternalIterator for MemtableIter {
    fn first(&mut self) -> Result<()> {
        self.current = self
            .mem
            .points
            .front()
            .map(|e| (e.key().key().clone(), e.value().clone()));
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        self.current = self
            .mem
            .points
            .back()
            .map(|e| (e.key().key().clone(), e.value().clone()));
        Ok(())
    }

    fn seek_ge(&mut self, user_key: &[u8]) -> Result<()> {
        let bound = self.bound(InternalKey::range_end_sentinel(user_key));
        self.current = self
            .mem
            .points
            .range(bound..)
            .next()
            .map(|e| (e.key().key().clone(), e.value().clone()));
        Ok(())
    }

    fn seek_lt(&mut self, user_key: &[u8]) -> Result<()> {
        let bound = self.bound(InternalKey::range_end_sentinel(user_key));
        self.current = self
            .mem
            .points
            .range(..bound)
            .next_back()
            .map(|e| (e.key().key().clone(), e.value().clone()));
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let (key, _) = self.current.take().expect("next on invalid iterator");
        let bound = self.bound(key);
        self.current = self
            .mem
            .points
            .range((std::ops::Bound::Excluded(bound), std::ops::Bound::Unbounded))
            .next()
            .map(|e| (e.key().key().clone(), e.value().clone()));
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let (key, _) = self.current.take().expect("prev on invalid iterator");
        let bound = self.bound(key);
        self.current = self
            .mem
            .points
            .range(..bound)
            .next_back()
            .map(|e| (e.key().key().clone(), e.value().clone()));
        Ok(())
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &InternalKey {
        &self.current.as_ref().expect("key on invalid iterator").0
    }

    fn value(&self) -> &[u8] {
        &self.current.as_ref().expect("value on invalid iterator").1
    }
}
