//! The user-facing iterator.
//!
//! Interleaves the resolved point stream with fragmented range-key spans.
//! Every position surfaces up to three observables: the point entry (if
//! any), the covering range-key span, and a flag reporting that the
//! covering span changed. When a span starts strictly between point keys
//! the iterator synthesizes a marker position at the boundary with no
//! point; stepping off the marker resumes the point stream.
//!
//! The cursor is an explicit struct: current user key, direction, the
//! pending resolved point, and the span table. Direction reversal re-seeks
//! the underlying merging iterator around the current key.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use super::merging::MergingIter;
use crate::iterator::InternalIterator;
use crate::comparator::Comparator;
use crate::config::MergeFn;
use crate::errinput;
use crate::error::Result;
use crate::key::{is_visible, KeyKind};
use crate::keyspan::{rangedel_covers, resolve_range_keys, Span, SpanKey};
use crate::version::Version;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Forward,
    Backward,
}

/// Construction inputs for a [`DbIterator`]: the merged point stream plus
/// the fragmented span collections of every layer in the read view.
pub struct IterConfig<'a> {
    pub cmp: &'static Comparator,
    pub merge: MergeFn,
    pub visible_seq: u64,
    pub point: MergingIter<'a>,
    pub rangedels: Vec<Span>,
    pub rangekeys: Vec<Span>,
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
    pub mask_suffix: Option<Vec<u8>>,
    /// Version pinned for the iterator's lifetime: while held, no file the
    /// iterator may lazily open can be deleted as obsolete.
    pub version: Option<Arc<Version>>,
}

/// Options applied by [`DbIterator::set_options`].
#[derive(Debug, Clone, Default)]
pub struct IterOptions {
    pub lower: Option<Vec<u8>>,
    pub upper: Option<Vec<u8>>,
    pub mask_suffix: Option<Vec<u8>>,
}

pub struct DbIterator<'a> {
    cmp: &'static Comparator,
    merge: MergeFn,
    visible_seq: u64,
    point: MergingIter<'a>,
    rangedels: Vec<Span>,
    /// Resolved visible range-key fragments, start-ordered and disjoint.
    rangekeys: Vec<Span>,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    mask_suffix: Option<Vec<u8>>,
    /// Active prefix from `seek_prefix_ge`.
    prefix: Option<Vec<u8>>,
    _version: Option<Arc<Version>>,

    valid: bool,
    closed: bool,
    dir: Direction,
    at_key: Vec<u8>,
    point_value: Option<Vec<u8>>,
    /// Next resolved point in the travel direction, not yet surfaced.
    pending: Option<(Vec<u8>, Vec<u8>)>,
    span_idx: Option<usize>,
    range_key_changed: bool,
}

impl<'a> DbIterator<'a> {
    pub fn new(config: IterConfig<'a>) -> Self {
        let cmp = config.cmp;
        let visible_seq = config.visible_seq;
        // Resolve range-key fragments down to what a reader at this
        // sequence observes; fragments with nothing surviving vanish.
        let rangekeys = config
            .rangekeys
            .into_iter()
            .filter_map(|span| {
                let visible = span.visible_at(visible_seq)?;
                let keys = resolve_range_keys(cmp, &visible);
                if keys.is_empty() {
                    None
                } else {
                    Some(Span::new(visible.start, visible.end, keys))
                }
            })
            .collect();
        Self {
            cmp,
            merge: config.merge,
            visible_seq,
            point: config.point,
            rangedels: config.rangedels,
            rangekeys,
            lower: config.lower,
            upper: config.upper,
            mask_suffix: config.mask_suffix,
            prefix: None,
            _version: config.version,
            valid: false,
            closed: false,
            dir: Direction::Forward,
            at_key: Vec::new(),
            point_value: None,
            pending: None,
            span_idx: None,
            range_key_changed: false,
        }
    }

    // Observables ---------------------------------------------------------

    pub fn valid(&self) -> bool {
        self.valid && !self.closed
    }

    /// Current position's user key.
    pub fn key(&self) -> &[u8] {
        &self.at_key
    }

    /// Point value at the current position; None on a synthesized marker.
    pub fn point_value(&self) -> Option<&[u8]> {
        self.point_value.as_deref()
    }

    /// The covering range-key span `(start, end, keys)` at the current
    /// position.
    pub fn range_key(&self) -> Option<(&[u8], &[u8], &[SpanKey])> {
        self.span_idx.map(|i| {
            let s = &self.rangekeys[i];
            (s.start.as_slice(), s.end.as_slice(), s.keys.as_slice())
        })
    }

    /// Whether the covering span differs from the previous position's.
    pub fn range_key_changed(&self) -> bool {
        self.range_key_changed
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.valid = false;
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidArgument("iterator used after close".into()));
        }
        Ok(())
    }

    // Bounds and spans ----------------------------------------------------

    fn below_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Some(upper) => self.cmp.cmp(key, upper) == CmpOrdering::Less,
            None => true,
        }
    }

    fn at_or_above_lower(&self, key: &[u8]) -> bool {
        match &self.lower {
            Some(lower) => self.cmp.cmp(key, lower) != CmpOrdering::Less,
            None => true,
        }
    }

    fn in_prefix(&self, key: &[u8]) -> bool {
        match &self.prefix {
            Some(prefix) => self.cmp.cmp(self.cmp.prefix(key), prefix) == CmpOrdering::Equal,
            None => true,
        }
    }

    /// Index of the span covering `key`, if any.
    fn covering_span(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .rangekeys
            .partition_point(|s| self.cmp.cmp(&s.start, key) != CmpOrdering::Greater);
        if idx == 0 {
            return None;
        }
        let span = &self.rangekeys[idx - 1];
        span.covers(self.cmp, key).then_some(idx - 1)
    }

    /// Smallest admissible span start strictly greater than `from` (or at
    /// `from` when `inclusive`), clamped by bounds and prefix.
    fn marker_after(&self, from: &[u8], inclusive: bool) -> Option<Vec<u8>> {
        if inclusive && self.covering_span(from).is_some() {
            let candidate = from.to_vec();
            if self.below_upper(&candidate) && self.in_prefix(&candidate) {
                return Some(candidate);
            }
        }
        let idx = self.rangekeys.partition_point(|s| {
            let ord = self.cmp.cmp(&s.start, from);
            ord == CmpOrdering::Less || (!inclusive && ord == CmpOrdering::Equal)
        });
        let span = self.rangekeys.get(idx)?;
        let candidate = if self.at_or_above_lower(&span.start) {
            span.start.clone()
        } else {
            self.lower.clone().expect("lower bound exists when clamping")
        };
        (self.below_upper(&candidate) && self.in_prefix(&candidate)).then_some(candidate)
    }

    /// Largest admissible span start strictly less than `from`, clamped to
    /// the lower bound.
    fn marker_before(&self, from: &[u8]) -> Option<Vec<u8>> {
        let idx = self
            .rangekeys
            .partition_point(|s| self.cmp.cmp(&s.start, from) == CmpOrdering::Less);
        // Spans at idx.. start at or after `from`; walk down for one whose
        // clamped marker still precedes `from`.
        for span in self.rangekeys[..idx].iter().rev() {
            let candidate = if self.at_or_above_lower(&span.start) {
                span.start.clone()
            } else {
                // Clamped to the lower bound; the span must still cover it.
                let lower = self.lower.clone().expect("lower bound exists when clamping");
                if self.cmp.cmp(&lower, &span.end) != CmpOrdering::Less {
                    continue;
                }
                lower
            };
            if self.cmp.cmp(&candidate, from) == CmpOrdering::Less
                && self.below_upper(&candidate)
                && self.in_prefix(&candidate)
            {
                return Some(candidate);
            }
        }
        None
    }

    // Point resolution ----------------------------------------------------

    /// Collapses the versions of one user key (newest-first) into its
    /// visible value.
    fn resolve_versions(
        &self,
        user_key: &[u8],
        versions: &[(u64, KeyKind, Vec<u8>)],
    ) -> Option<Vec<u8>> {
        let mut merge_ops: Vec<Vec<u8>> = Vec::new();
        let mut skip_next_set = false;
        for (seq, kind, value) in versions {
            if !is_visible(*seq, self.visible_seq) {
                continue;
            }
            if rangedel_covers(self.cmp, &self.rangedels, user_key, *seq, self.visible_seq) {
                // Everything from here down is shadowed by a tombstone.
                break;
            }
            match kind {
                KeyKind::Set | KeyKind::SetWithDelete => {
                    if skip_next_set {
                        skip_next_set = false;
                        continue;
                    }
                    // Merge operands fold oldest-first over the base value.
                    let mut acc = value.clone();
                    for op in merge_ops.iter().rev() {
                        acc = (self.merge)(user_key, Some(&acc), op);
                    }
                    return Some(acc);
                }
                KeyKind::Delete | KeyKind::DeleteSized => break,
                KeyKind::SingleDelete => skip_next_set = true,
                KeyKind::Merge => {
                    if skip_next_set {
                        skip_next_set = false;
                        continue;
                    }
                    merge_ops.push(value.clone());
                }
                _ => {}
            }
        }
        if merge_ops.is_empty() {
            return None;
        }
        let mut acc: Option<Vec<u8>> = None;
        for op in merge_ops.iter().rev() {
            acc = Some((self.merge)(user_key, acc.as_deref(), op));
        }
        acc
    }

    /// Whether a resolved point at `user_key` is elided by range-key
    /// masking: its suffix is older than the mask and a covering range key
    /// at or newer than the mask dominates it.
    fn masked(&self, user_key: &[u8]) -> bool {
        let Some(mask) = &self.mask_suffix else {
            return false;
        };
        let s_p = self.cmp.suffix(user_key);
        if s_p.is_empty() || self.cmp.cmp_suffixes(s_p, mask) != CmpOrdering::Greater {
            return false;
        }
        let Some(idx) = self.covering_span(user_key) else {
            return false;
        };
        self.rangekeys[idx].keys.iter().any(|k| {
            !k.suffix.is_empty()
                && self.cmp.cmp_suffixes(&k.suffix, mask) != CmpOrdering::Greater
                && self.cmp.cmp_suffixes(&k.suffix, s_p) != CmpOrdering::Greater
        })
    }

    /// Next visible point at or after the merging iterator's position.
    /// Leaves the merging iterator on the first entry of the following
    /// user key.
    fn resolve_forward(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while self.point.valid() {
            let user_key = self.point.key().user_key.clone();
            if !self.below_upper(&user_key) || !self.in_prefix(&user_key) {
                return Ok(None);
            }
            let mut versions: Vec<(u64, KeyKind, Vec<u8>)> = Vec::new();
            while self.point.valid()
                && self.cmp.cmp(&self.point.key().user_key, &user_key) == CmpOrdering::Equal
            {
                versions.push((
                    self.point.key().seq(),
                    self.point.key().kind(),
                    self.point.value().to_vec(),
                ));
                self.point.next()?;
            }
            if let Some(value) = self.resolve_versions(&user_key, &versions) {
                if !self.masked(&user_key) {
                    return Ok(Some((user_key, value)));
                }
            }
        }
        Ok(None)
    }

    /// Next visible point at or before the merging iterator's position,
    /// walking backward. Leaves the merging iterator on the last entry of
    /// the preceding user key.
    fn resolve_backward(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while self.point.valid() {
            let user_key = self.point.key().user_key.clone();
            if !self.at_or_above_lower(&user_key) || !self.in_prefix(&user_key) {
                return Ok(None);
            }
            let mut versions: Vec<(u64, KeyKind, Vec<u8>)> = Vec::new();
            while self.point.valid()
                && self.cmp.cmp(&self.point.key().user_key, &user_key) == CmpOrdering::Equal
            {
                versions.push((
                    self.point.key().seq(),
                    self.point.key().kind(),
                    self.point.value().to_vec(),
                ));
                self.point.prev()?;
            }
            // Backward traversal collects oldest-first.
            versions.reverse();
            if let Some(value) = self.resolve_versions(&user_key, &versions) {
                if !self.masked(&user_key) {
                    return Ok(Some((user_key, value)));
                }
            }
        }
        Ok(None)
    }

    // Position selection --------------------------------------------------

    fn note_position(&mut self, key: Vec<u8>, point_value: Option<Vec<u8>>) {
        let new_span = self.covering_span(&key);
        self.range_key_changed = new_span != self.span_idx;
        self.span_idx = new_span;
        self.at_key = key;
        self.point_value = point_value;
        self.valid = true;
    }

    fn invalidate(&mut self) {
        self.range_key_changed = self.span_idx.is_some();
        self.span_idx = None;
        self.valid = false;
        self.point_value = None;
        self.pending = None;
    }

    /// Surfaces the earlier of the pending point and the marker candidate.
    fn settle_forward(&mut self, marker: Option<Vec<u8>>) -> Result<()> {
        match (self.pending.clone(), marker) {
            (Some((pk, pv)), Some(mk)) => {
                if self.cmp.cmp(&mk, &pk) == CmpOrdering::Less {
                    // Marker strictly before the next point.
                    self.note_position(mk, None);
                } else {
                    self.pending = None;
                    self.note_position(pk, Some(pv));
                }
            }
            (Some((pk, pv)), None) => {
                self.pending = None;
                self.note_position(pk, Some(pv));
            }
            (None, Some(mk)) => self.note_position(mk, None),
            (None, None) => self.invalidate(),
        }
        Ok(())
    }

    /// Surfaces the later of the pending point and the marker candidate.
    fn settle_backward(&mut self, marker: Option<Vec<u8>>) -> Result<()> {
        match (self.pending.clone(), marker) {
            (Some((pk, pv)), Some(mk)) => {
                if self.cmp.cmp(&mk, &pk) == CmpOrdering::Greater {
                    self.note_position(mk, None);
                } else {
                    self.pending = None;
                    self.note_position(pk, Some(pv));
                }
            }
            (Some((pk, pv)), None) => {
                self.pending = None;
                self.note_position(pk, Some(pv));
            }
            (None, Some(mk)) => self.note_position(mk, None),
            (None, None) => self.invalidate(),
        }
        Ok(())
    }

    // Operations ----------------------------------------------------------

    pub fn seek_ge(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.prefix = None;
        self.seek_ge_inner(key)
    }

    fn seek_ge_inner(&mut self, key: &[u8]) -> Result<()> {
        let target = match &self.lower {
            Some(lower) if self.cmp.cmp(key, lower) == CmpOrdering::Less => lower.clone(),
            _ => key.to_vec(),
        };
        self.dir = Direction::Forward;
        self.point.seek_ge(&target)?;
        self.pending = self.resolve_forward()?;
        let marker = self.marker_after(&target, true);
        self.settle_forward(marker)
    }

    pub fn seek_lt(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.prefix = None;
        let target = match &self.upper {
            Some(upper) if self.cmp.cmp(key, upper) == CmpOrdering::Greater => upper.clone(),
            _ => key.to_vec(),
        };
        self.dir = Direction::Backward;
        self.point.seek_lt(&target)?;
        self.pending = self.resolve_backward()?;
        let marker = self.marker_before(&target);
        self.settle_backward(marker)
    }

    pub fn first(&mut self) -> Result<()> {
        self.check_open()?;
        self.prefix = None;
        match self.lower.clone() {
            Some(lower) => self.seek_ge_inner(&lower),
            None => {
                self.dir = Direction::Forward;
                self.point.first()?;
                self.pending = self.resolve_forward()?;
                let marker = match self.rangekeys.first() {
                    Some(span) => self.marker_after(&span.start, true),
                    None => None,
                };
                self.settle_forward(marker)
            }
        }
    }

    pub fn last(&mut self) -> Result<()> {
        self.check_open()?;
        self.prefix = None;
        match self.upper.clone() {
            Some(upper) => {
                self.dir = Direction::Backward;
                self.point.seek_lt(&upper)?;
                self.pending = self.resolve_backward()?;
                let marker = self.marker_before(&upper);
                self.settle_backward(marker)
            }
            None => {
                self.dir = Direction::Backward;
                self.point.last()?;
                self.pending = self.resolve_backward()?;
                let marker = self.last_marker();
                self.settle_backward(marker)
            }
        }
    }

    /// Largest admissible marker with no exclusive ceiling.
    fn last_marker(&self) -> Option<Vec<u8>> {
        for span in self.rangekeys.iter().rev() {
            let candidate = if self.at_or_above_lower(&span.start) {
                span.start.clone()
            } else {
                let lower = self.lower.clone()?;
                if self.cmp.cmp(&lower, &span.end) != CmpOrdering::Less {
                    continue;
                }
                lower
            };
            if self.below_upper(&candidate) && self.in_prefix(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn next(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.valid {
            return errinput!("next on invalid iterator");
        }
        if self.dir == Direction::Backward {
            // Re-seek the point stream to resume forward after at_key.
            let at = self.at_key.clone();
            self.point.seek_ge(&at)?;
            self.pending = self.resolve_forward()?;
            if let Some((pk, _)) = &self.pending {
                if self.cmp.cmp(pk, &at) == CmpOrdering::Equal {
                    self.pending = self.resolve_forward()?;
                }
            }
            self.dir = Direction::Forward;
        } else if self.point_value.is_some() {
            // The surfaced point was consumed; pull the next.
            self.pending = self.resolve_forward()?;
        }
        // A marker position keeps its pending point.
        if let Some((pk, _)) = &self.pending {
            if self.cmp.cmp(pk, &self.at_key) != CmpOrdering::Greater {
                // Stale pending at or before the current position.
                self.pending = self.resolve_forward()?;
            }
        }
        let marker = self.marker_after(&self.at_key.clone(), false);
        self.settle_forward(marker)
    }

    pub fn prev(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.valid {
            return errinput!("prev on invalid iterator");
        }
        if self.dir == Direction::Forward {
            let at = self.at_key.clone();
            self.point.seek_lt(&at)?;
            self.pending = self.resolve_backward()?;
            self.dir = Direction::Backward;
        } else if self.point_value.is_some() {
            self.pending = self.resolve_backward()?;
        }
        if let Some((pk, _)) = &self.pending {
            if self.cmp.cmp(pk, &self.at_key) != CmpOrdering::Less {
                self.pending = self.resolve_backward()?;
            }
        }
        let marker = self.marker_before(&self.at_key.clone());
        self.settle_backward(marker)
    }

    /// Restricts iteration to keys sharing `key`'s prefix and positions at
    /// the first admissible position `>= key`.
    pub fn seek_prefix_ge(&mut self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.prefix = Some(self.cmp.prefix(key).to_vec());
        self.seek_ge_inner(key)
    }

    /// Advances to the first position of the next prefix. Exits prefix
    /// mode.
    pub fn next_prefix(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.valid {
            return errinput!("next_prefix on invalid iterator");
        }
        self.prefix = None;
        let prefix = self.cmp.prefix(&self.at_key).to_vec();
        match self.cmp.prefix_successor(&prefix) {
            Some(succ) => self.seek_ge_inner(&succ),
            None => {
                self.invalidate();
                Ok(())
            }
        }
    }

    /// Replaces the iteration bounds. The iterator becomes unpositioned;
    /// the next absolute seek applies the new bounds.
    pub fn set_bounds(&mut self, lower: Option<Vec<u8>>, upper: Option<Vec<u8>>) -> Result<()> {
        self.check_open()?;
        if let (Some(lo), Some(hi)) = (&lower, &upper) {
            if self.cmp.cmp(lo, hi) != CmpOrdering::Less {
                return errinput!("iterator bounds are inverted");
            }
        }
        self.lower = lower;
        self.upper = upper;
        self.invalidate();
        self.range_key_changed = false;
        self.span_idx = None;
        Ok(())
    }

    /// Replaces bounds and the range-key mask. The iterator becomes
    /// unpositioned.
    pub fn set_options(&mut self, options: IterOptions) -> Result<()> {
        self.set_bounds(options.lower, options.upper)?;
        self.mask_suffix = options.mask_suffix;
        Ok(())
    }
}
