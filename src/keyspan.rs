//! Key spans: range tombstones and range keys.
//!
//! A span covers the user-key interval `[start, end)` and carries one entry
//! per originating record. Spans from a single layer never overlap; spans
//! from different layers overlap freely and are merged by the
//! [`Fragmenter`] into non-overlapping fragments whose start boundaries are
//! exactly the union of the input boundaries.

use std::cmp::Ordering;

use crate::comparator::Comparator;
use crate::errinput;
use crate::error::Result;
use crate::key::{is_visible, trailer_kind, trailer_seq, KeyKind};

/// One record within a span: `(seq, kind)` trailer plus the suffix and
/// value payloads (empty where the kind carries none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanKey {
    pub trailer: u64,
    pub suffix: Vec<u8>,
    pub value: Vec<u8>,
}

impl SpanKey {
    pub fn new(trailer: u64, suffix: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            trailer,
            suffix,
            value,
        }
    }

    pub fn seq(&self) -> u64 {
        trailer_seq(self.trailer)
    }

    pub fn kind(&self) -> KeyKind {
        trailer_kind(self.trailer).expect("span key holds a valid kind")
    }
}

/// A user-key interval `[start, end)` and the records covering it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    /// Sorted by trailer descending (newest first).
    pub keys: Vec<SpanKey>,
}

impl Span {
    pub fn new(start: Vec<u8>, end: Vec<u8>, keys: Vec<SpanKey>) -> Self {
        Self { start, end, keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Whether `key` falls inside `[start, end)`.
    pub fn covers(&self, cmp: &Comparator, key: &[u8]) -> bool {
        cmp.cmp(&self.start, key) != Ordering::Greater && cmp.cmp(key, &self.end) == Ordering::Less
    }

    /// The span restricted to records visible at `seq`, or None when none
    /// remain.
    pub fn visible_at(&self, seq: u64) -> Option<Span> {
        let keys: Vec<SpanKey> = self
            .keys
            .iter()
            .filter(|k| is_visible(k.seq(), seq))
            .cloned()
            .collect();
        if keys.is_empty() {
            None
        } else {
            Some(Span::new(self.start.clone(), self.end.clone(), keys))
        }
    }

    /// The largest sequence number among this span's keys.
    pub fn largest_seq(&self) -> u64 {
        self.keys.iter().map(SpanKey::seq).max().unwrap_or(0)
    }

    /// The span clipped to `[lower, upper)`, or None when the intersection
    /// is empty.
    pub fn truncate(&self, cmp: &Comparator, lower: Option<&[u8]>, upper: Option<&[u8]>) -> Option<Span> {
        let mut start = self.start.as_slice();
        let mut end = self.end.as_slice();
        if let Some(lo) = lower {
            if cmp.cmp(start, lo) == Ordering::Less {
                start = lo;
            }
        }
        if let Some(hi) = upper {
            if cmp.cmp(end, hi) == Ordering::Greater {
                end = hi;
            }
        }
        if cmp.cmp(start, end) != Ordering::Less {
            return None;
        }
        Some(Span::new(start.to_vec(), end.to_vec(), self.keys.clone()))
    }
}

fn sort_span_keys(keys: &mut [SpanKey], cmp: &Comparator) {
    keys.sort_by(|a, b| {
        b.trailer
            .cmp(&a.trailer)
            .then_with(|| cmp.cmp_suffixes(&a.suffix, &b.suffix))
    });
}

/// Merges overlapping spans from many layers into non-overlapping
/// fragments.
///
/// Inputs must arrive ordered by start. Each output fragment spans two
/// adjacent boundaries of the input boundary union and carries every input
/// key whose span covered it, sorted newest-first. Abutting fragments share
/// a boundary; gaps produce no fragment.
pub struct Fragmenter<'a> {
    cmp: &'a Comparator,
    spans: Vec<Span>,
}

impl<'a> Fragmenter<'a> {
    pub fn new(cmp: &'a Comparator) -> Self {
        Self {
            cmp,
            spans: Vec::new(),
        }
    }

    /// Adds a span. Fails with `InvalidArgument` on an inverted interval or
    /// when `span.start` precedes the previous span's start.
    pub fn add(&mut self, span: Span) -> Result<()> {
        if self.cmp.cmp(&span.start, &span.end) != Ordering::Less {
            return errinput!(
                "span end {:?} not after start {:?}",
                String::from_utf8_lossy(&span.end),
                String::from_utf8_lossy(&span.start)
            );
        }
        if let Some(last) = self.spans.last() {
            if self.cmp.cmp(&span.start, &last.start) == Ordering::Less {
                return errinput!("spans must be added in start order");
            }
        }
        if !span.is_empty() {
            self.spans.push(span);
        }
        Ok(())
    }

    /// Emits the fragments.
    pub fn finish(self) -> Vec<Span> {
        let cmp = self.cmp;
        if self.spans.is_empty() {
            return Vec::new();
        }

        // Boundary union: all starts and ends, deduplicated in key order.
        let mut bounds: Vec<&[u8]> = Vec::with_capacity(self.spans.len() * 2);
        for s in &self.spans {
            bounds.push(&s.start);
            bounds.push(&s.end);
        }
        bounds.sort_by(|a, b| cmp.cmp(a, b));
        bounds.dedup_by(|a, b| cmp.cmp(a, b) == Ordering::Equal);

        let mut out = Vec::new();
        for w in bounds.windows(2) {
            let (lo, hi) = (w[0], w[1]);
            let mut keys: Vec<SpanKey> = Vec::new();
            for s in &self.spans {
                if cmp.cmp(&s.start, lo) != Ordering::Greater
                    && cmp.cmp(lo, &s.end) == Ordering::Less
                {
                    keys.extend(s.keys.iter().cloned());
                }
            }
            if !keys.is_empty() {
                sort_span_keys(&mut keys, cmp);
                out.push(Span::new(lo.to_vec(), hi.to_vec(), keys));
            }
        }
        out
    }
}

/// Fragments an unordered collection of spans.
pub fn fragment_all(cmp: &Comparator, mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by(|a, b| cmp.cmp(&a.start, &b.start));
    let mut f = Fragmenter::new(cmp);
    for s in spans {
        // Ordered above; add only rejects inverted intervals.
        if f.add(s).is_err() {
            continue;
        }
    }
    f.finish()
}

/// Resolves a range-key fragment's records into the suffix/value pairs a
/// reader observes: a `RangeKeySet` survives unless hidden by a newer
/// `RangeKeyDelete` or a newer `RangeKeyUnset` with the same suffix. The
/// result is ordered by the suffix order.
pub fn resolve_range_keys(cmp: &Comparator, span: &Span) -> Vec<SpanKey> {
    let mut max_del_seq = 0u64;
    let mut unset: Vec<(&[u8], u64)> = Vec::new();
    let mut out: Vec<SpanKey> = Vec::new();

    // Keys arrive newest-first.
    for k in &span.keys {
        match k.kind() {
            KeyKind::RangeKeyDelete => max_del_seq = max_del_seq.max(k.seq()),
            KeyKind::RangeKeyUnset => {
                if !unset.iter().any(|(s, _)| cmp.cmp_suffixes(s, &k.suffix) == Ordering::Equal) {
                    unset.push((&k.suffix, k.seq()));
                }
            }
            KeyKind::RangeKeySet => {
                if k.seq() < max_del_seq {
                    continue;
                }
                if unset
                    .iter()
                    .any(|(s, seq)| *seq > k.seq() && cmp.cmp_suffixes(s, &k.suffix) == Ordering::Equal)
                {
                    continue;
                }
                if out
                    .iter()
                    .any(|s| cmp.cmp_suffixes(&s.suffix, &k.suffix) == Ordering::Equal)
                {
                    // An older set of the same suffix is shadowed.
                    continue;
                }
                out.push(k.clone());
            }
            _ => {}
        }
    }
    out.sort_by(|a, b| cmp.cmp_suffixes(&a.suffix, &b.suffix));
    out
}

/// Whether any tombstone fragment hides `(user_key, seq)`: some fragment
/// covering the key carries a delete whose seq lies in `(seq, visible_seq]`.
pub fn rangedel_covers(
    cmp: &Comparator,
    fragments: &[Span],
    user_key: &[u8],
    seq: u64,
    visible_seq: u64,
) -> bool {
    fragments.iter().any(|f| {
        f.covers(cmp, user_key)
            && f.keys
                .iter()
                .any(|k| k.seq() > seq && is_visible(k.seq(), visible_seq))
    })
}
