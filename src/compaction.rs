//! Compaction execution.
//!
//! Merges input iterators, drops entries shadowed within their snapshot
//! stripe, elides tombstones at the bottommost level, and splits outputs
//! at user-key boundaries when they exceed the target size. Straddling
//! range spans are clipped to each output's boundary, which puts the `inf`
//! end sentinel on the file's largest key and keeps the deeper-level
//! non-overlap invariant intact. A flush is the same execution with
//! memtable inputs and L0 outputs.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::comparator::Comparator;
use crate::config::MergeFn;
use crate::error::Result;
use crate::iterator::merging::MergingIter;
use crate::iterator::InternalIterator;
use crate::key::{make_trailer, InternalKey, KeyKind};
use crate::keyspan::{Span, SpanKey};
use crate::snapshot::stripe_of;
use crate::sstable::{sst_path, TableWriter};
use crate::version::FileMetadata;
use crate::Error;

/// Inputs to one compaction: the merged point stream and the fragmented
/// span collections of every input file and memtable.
pub struct CompactionInput<'a> {
    pub point: MergingIter<'a>,
    pub rangedels: Vec<Span>,
    pub rangekeys: Vec<Span>,
}

pub struct CompactionParams<'a> {
    pub cmp: &'static Comparator,
    pub merge: MergeFn,
    pub dir: &'a Path,
    /// Open snapshot seqs, ascending.
    pub snapshots: Vec<u64>,
    /// Whether outputs land on the bottommost populated level: tombstones
    /// with no snapshot above them are elided entirely.
    pub bottommost: bool,
    pub target_file_size: u64,
    pub output_level: u32,
    pub file_nums: &'a AtomicU64,
    pub shutting_down: Option<&'a AtomicBool>,
}

impl CompactionParams<'_> {
    fn check_shutdown(&self) -> Result<()> {
        if let Some(flag) = self.shutting_down {
            if flag.load(Ordering::SeqCst) {
                return Err(Error::Io("database shutting down".into()));
            }
        }
        Ok(())
    }
}

/// One resolved user-key batch of output records.
struct KeyOutput {
    records: Vec<(InternalKey, Vec<u8>)>,
}

/// Applies snapshot-stripe shadowing to the versions of one user key
/// (newest first). Emits the surviving records, newest first.
fn compact_user_key(
    params: &CompactionParams,
    rangedels: &[Span],
    user_key: &[u8],
    versions: &[(u64, KeyKind, Vec<u8>)],
) -> KeyOutput {
    let cmp = params.cmp;
    let mut out: Vec<(InternalKey, Vec<u8>)> = Vec::new();
    // Pending merge accumulation: operands newest-first plus the seq of
    // the newest operand, which the folded record keeps.
    let mut merge_ops: Vec<Vec<u8>> = Vec::new();
    let mut merge_seq = 0u64;
    let mut merge_stripe = usize::MAX;
    let mut shadowed_stripe: Option<usize> = None;
    // Position and stripe of the set most recently emitted, so a point
    // tombstone it shadows can promote it to SetWithDelete.
    let mut emitted_set: Option<(usize, usize)> = None;

    let fold = |ops: &[Vec<u8>], base: Option<&[u8]>| -> Vec<u8> {
        let mut acc: Option<Vec<u8>> = base.map(<[u8]>::to_vec);
        for op in ops.iter().rev() {
            acc = Some((params.merge)(user_key, acc.as_deref(), op));
        }
        acc.unwrap_or_default()
    };

    let covered = |seq: u64| -> bool {
        rangedels.iter().any(|f| {
            f.covers(cmp, user_key)
                && f.keys.iter().any(|k| {
                    k.seq() > seq
                        && stripe_of(k.seq(), &params.snapshots)
                            == stripe_of(seq, &params.snapshots)
                })
        })
    };

    let mut i = 0;
    while i < versions.len() {
        let (seq, kind, value) = &versions[i];
        let stripe = stripe_of(*seq, &params.snapshots);
        i += 1;

        // Finalize a merge accumulation when leaving its stripe.
        if !merge_ops.is_empty() && stripe != merge_stripe {
            out.push((
                InternalKey::new(user_key, merge_seq, KeyKind::Merge),
                fold(&merge_ops, None),
            ));
            merge_ops.clear();
        }

        if shadowed_stripe == Some(stripe) {
            // Dropping a point tombstone under a surviving set: the set
            // must keep shadowing whatever the tombstone hid below this
            // compaction, so it becomes SetWithDelete.
            if !params.bottommost && kind.is_point_tombstone() {
                if let Some((idx, set_stripe)) = emitted_set {
                    if set_stripe == stripe {
                        let record = &mut out[idx];
                        record.0.trailer =
                            make_trailer(record.0.seq(), KeyKind::SetWithDelete);
                    }
                }
            }
            continue;
        }
        if covered(*seq) {
            // A same-stripe range tombstone hides this version and every
            // older one in the stripe.
            if !merge_ops.is_empty() && merge_stripe == stripe {
                out.push((
                    InternalKey::new(user_key, merge_seq, KeyKind::Merge),
                    fold(&merge_ops, None),
                ));
                merge_ops.clear();
            }
            shadowed_stripe = Some(stripe);
            continue;
        }

        match kind {
            KeyKind::Set | KeyKind::SetWithDelete => {
                if !merge_ops.is_empty() && merge_stripe == stripe {
                    // The merge absorbs its base.
                    out.push((
                        InternalKey::new(user_key, merge_seq, *kind),
                        fold(&merge_ops, Some(value)),
                    ));
                    merge_ops.clear();
                } else {
                    out.push((InternalKey::new(user_key, *seq, *kind), value.clone()));
                }
                emitted_set = Some((out.len() - 1, stripe));
                shadowed_stripe = Some(stripe);
            }
            KeyKind::Delete | KeyKind::DeleteSized => {
                if !merge_ops.is_empty() && merge_stripe == stripe {
                    // Folded operands become a set that also shadows
                    // whatever the delete hid below this compaction.
                    out.push((
                        InternalKey::new(user_key, merge_seq, KeyKind::SetWithDelete),
                        fold(&merge_ops, None),
                    ));
                    merge_ops.clear();
                } else if !(params.bottommost && stripe == 0) {
                    out.push((InternalKey::new(user_key, *seq, *kind), value.clone()));
                }
                shadowed_stripe = Some(stripe);
            }
            KeyKind::SingleDelete => {
                // Annihilates with an immediately-older same-stripe set
                // when nothing else intervenes.
                let next = versions.get(i);
                match next {
                    Some((nseq, nkind, _))
                        if matches!(nkind, KeyKind::Set)
                            && stripe_of(*nseq, &params.snapshots) == stripe
                            && !covered(*nseq) =>
                    {
                        i += 1;
                    }
                    _ => {
                        out.push((
                            InternalKey::new(user_key, *seq, KeyKind::SingleDelete),
                            Vec::new(),
                        ));
                    }
                }
            }
            KeyKind::Merge => {
                if merge_ops.is_empty() {
                    merge_seq = *seq;
                    merge_stripe = stripe;
                }
                merge_ops.push(value.clone());
            }
            _ => {}
        }
    }
    if !merge_ops.is_empty() {
        out.push((
            InternalKey::new(user_key, merge_seq, KeyKind::Merge),
            fold(&merge_ops, None),
        ));
    }
    KeyOutput { records: out }
}

/// Reduces a range tombstone fragment: the newest key per stripe
/// survives; at the bottommost level, stripe-0 tombstones vanish.
fn compact_rangedel_fragment(params: &CompactionParams, span: &Span) -> Option<Span> {
    let mut kept: Vec<SpanKey> = Vec::new();
    let mut last_stripe = usize::MAX;
    for key in &span.keys {
        let stripe = stripe_of(key.seq(), &params.snapshots);
        if stripe == last_stripe {
            continue;
        }
        last_stripe = stripe;
        if params.bottommost && stripe == 0 {
            continue;
        }
        kept.push(key.clone());
    }
    if kept.is_empty() {
        None
    } else {
        Some(Span::new(span.start.clone(), span.end.clone(), kept))
    }
}

/// Reduces a range-key fragment stripe by stripe: within a stripe a
/// delete hides older records and an unset cancels same-suffix sets; at
/// the bottommost level, stripe-0 unsets and deletes vanish once applied.
fn compact_rangekey_fragment(params: &CompactionParams, span: &Span) -> Option<Span> {
    let cmp = params.cmp;
    let mut kept: Vec<SpanKey> = Vec::new();
    let mut idx = 0;
    while idx < span.keys.len() {
        let stripe = stripe_of(span.keys[idx].seq(), &params.snapshots);
        let mut stripe_keys: Vec<&SpanKey> = Vec::new();
        while idx < span.keys.len()
            && stripe_of(span.keys[idx].seq(), &params.snapshots) == stripe
        {
            stripe_keys.push(&span.keys[idx]);
            idx += 1;
        }

        let mut del_seen = false;
        let mut unsets: Vec<&[u8]> = Vec::new();
        let mut set_suffixes: Vec<&[u8]> = Vec::new();
        for key in stripe_keys {
            match key.kind() {
                KeyKind::RangeKeyDelete => {
                    if !del_seen && !(params.bottommost && stripe == 0) {
                        kept.push(key.clone());
                    }
                    del_seen = true;
                }
                KeyKind::RangeKeyUnset => {
                    if del_seen {
                        continue;
                    }
                    if unsets
                        .iter()
                        .any(|s| cmp.cmp_suffixes(s, &key.suffix) == std::cmp::Ordering::Equal)
                    {
                        continue;
                    }
                    unsets.push(&key.suffix);
                    if !(params.bottommost && stripe == 0) {
                        kept.push(key.clone());
                    }
                }
                KeyKind::RangeKeySet => {
                    if del_seen {
                        continue;
                    }
                    let unset = unsets
                        .iter()
                        .any(|s| cmp.cmp_suffixes(s, &key.suffix) == std::cmp::Ordering::Equal);
                    let shadowed = set_suffixes
                        .iter()
                        .any(|s| cmp.cmp_suffixes(s, &key.suffix) == std::cmp::Ordering::Equal);
                    if unset || shadowed {
                        continue;
                    }
                    set_suffixes.push(&key.suffix);
                    kept.push(key.clone());
                }
                _ => {}
            }
        }
    }
    if kept.is_empty() {
        None
    } else {
        Some(Span::new(span.start.clone(), span.end.clone(), kept))
    }
}

struct OutputState {
    writer: TableWriter,
    num: u64,
    first_key: Vec<u8>,
}

/// Runs the merge, producing output file metadata. On error, partially
/// written outputs are removed from disk.
pub fn run_compaction(
    params: &CompactionParams,
    mut input: CompactionInput<'_>,
) -> Result<Vec<FileMetadata>> {
    let input = &mut input;
    let cmp = params.cmp;

    let rangedels: Vec<Span> = input
        .rangedels
        .iter()
        .filter_map(|s| compact_rangedel_fragment(params, s))
        .collect();
    let rangekeys: Vec<Span> = input
        .rangekeys
        .iter()
        .filter_map(|s| compact_rangekey_fragment(params, s))
        .collect();

    let mut outputs: Vec<FileMetadata> = Vec::new();
    let mut written_nums: Vec<u64> = Vec::new();
    let mut current: Option<OutputState> = None;
    // User-key boundaries of closed outputs, for span distribution.
    let mut boundaries: Vec<(u64, Vec<u8>, Option<Vec<u8>>)> = Vec::new();

    let result: Result<()> = (|| {
        input.point.first()?;
        while input.point.valid() {
            let user_key = input.point.key().user_key.clone();
            let mut versions: Vec<(u64, KeyKind, Vec<u8>)> = Vec::new();
            while input.point.valid()
                && cmp.cmp(&input.point.key().user_key, &user_key) == std::cmp::Ordering::Equal
            {
                versions.push((
                    input.point.key().seq(),
                    input.point.key().kind(),
                    input.point.value().to_vec(),
                ));
                input.point.next()?;
            }
            let key_out = compact_user_key(params, &input.rangedels, &user_key, &versions);
            if key_out.records.is_empty() {
                continue;
            }

            // Roll the output at a user-key boundary once it is full.
            if let Some(state) = &current {
                if state.writer.estimated_size() >= params.target_file_size {
                    params.check_shutdown()?;
                    let state = current.take().expect("output is open");
                    boundaries.push((state.num, state.first_key.clone(), Some(user_key.clone())));
                    let meta = finish_output(params, state, &rangedels, &rangekeys, &boundaries)?;
                    outputs.push(meta);
                }
            }
            let state = match &mut current {
                Some(state) => state,
                None => {
                    let num = params.file_nums.fetch_add(1, Ordering::SeqCst);
                    written_nums.push(num);
                    current = Some(OutputState {
                        writer: TableWriter::new(cmp, sst_path(params.dir, num))?,
                        num,
                        first_key: user_key.clone(),
                    });
                    current.as_mut().expect("just opened")
                }
            };
            // Records arrive newest-first; trailer order is descending, so
            // they append in ascending internal-key order.
            for (key, value) in &key_out.records {
                state.writer.add(key, value)?;
            }
        }

        // Final output takes every remaining span.
        if current.is_none() && (!rangedels.is_empty() || !rangekeys.is_empty()) {
            let num = params.file_nums.fetch_add(1, Ordering::SeqCst);
            written_nums.push(num);
            current = Some(OutputState {
                writer: TableWriter::new(cmp, sst_path(params.dir, num))?,
                num,
                first_key: Vec::new(),
            });
        }
        if let Some(state) = current.take() {
            boundaries.push((state.num, state.first_key.clone(), None));
            let meta = finish_output(params, state, &rangedels, &rangekeys, &boundaries)?;
            if meta.size > 0 {
                outputs.push(meta);
            }
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(outputs),
        Err(e) => {
            for num in written_nums {
                let _ = std::fs::remove_file(sst_path(params.dir, num));
            }
            Err(e)
        }
    }
}

/// Closes one output: clips the surviving spans to the output's key
/// window, writes them, and builds the file metadata.
fn finish_output(
    params: &CompactionParams,
    state: OutputState,
    rangedels: &[Span],
    rangekeys: &[Span],
    boundaries: &[(u64, Vec<u8>, Option<Vec<u8>>)],
) -> Result<FileMetadata> {
    let cmp = params.cmp;
    let (_, _, upper) = boundaries.last().expect("boundary recorded for output");
    let is_first = boundaries.len() == 1;
    let lower = if is_first {
        None
    } else {
        Some(state.first_key.clone())
    };

    let mut writer = state.writer;
    for span in rangedels {
        if let Some(clipped) = span.truncate(cmp, lower.as_deref(), upper.as_deref()) {
            writer.add_rangedel_span(clipped)?;
        }
    }
    for span in rangekeys {
        if let Some(clipped) = span.truncate(cmp, lower.as_deref(), upper.as_deref()) {
            writer.add_rangekey_span(clipped)?;
        }
    }

    let path = writer.path().to_path_buf();
    let props = writer.finish()?;
    let size = std::fs::metadata(&path)?.len();
    let smallest = props.smallest(cmp);
    let largest = props.largest(cmp);
    if smallest.is_none() {
        // Nothing survived into this output; drop the empty file.
        std::fs::remove_file(&path)?;
        return Ok(FileMetadata {
            num: state.num,
            size: 0,
            smallest: InternalKey::new(Vec::<u8>::new(), 0, KeyKind::Set),
            largest: InternalKey::new(Vec::<u8>::new(), 0, KeyKind::Set),
            smallest_point: None,
            largest_point: None,
            smallest_range: None,
            largest_range: None,
            smallest_seq: 0,
            largest_seq: 0,
            creation_level: params.output_level,
            virtual_bounds: None,
            seq_override: None,
        });
    }
    Ok(FileMetadata {
        num: state.num,
        size,
        smallest: smallest.expect("non-empty output"),
        largest: largest.expect("non-empty output"),
        smallest_point: props.smallest_point.clone(),
        largest_point: props.largest_point.clone(),
        smallest_range: props.smallest_range.clone(),
        largest_range: props.largest_range.clone(),
        smallest_seq: props.smallest_seq,
        largest_seq: props.largest_seq,
        creation_level: params.output_level,
        virtual_bounds: None,
        seq_override: None,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::batch::Batch;
    use crate::comparator::BYTEWISE;
    use crate::config::concat_merge;
    use crate::iterator::BoxedIterator;
    use crate::keyspan::fragment_all;
    use crate::memtable::Memtable;
    use crate::sstable::TableReader;
    use crate::tmpfs::TempDir;

    fn params<'a>(
        dir: &'a TempDir,
        file_nums: &'a AtomicU64,
        snapshots: Vec<u64>,
        bottommost: bool,
    ) -> CompactionParams<'a> {
        CompactionParams {
            cmp: &BYTEWISE,
            merge: concat_merge,
            dir: dir.path(),
            snapshots,
            bottommost,
            target_file_size: 1 << 20,
            output_level: 6,
            file_nums,
            shutting_down: None,
        }
    }

    fn input_from(mems: &[Arc<Memtable>]) -> CompactionInput<'static> {
        let iters: Vec<BoxedIterator<'static>> = mems
            .iter()
            .map(|m| Box::new(m.point_iter()) as BoxedIterator<'static>)
            .collect();
        CompactionInput {
            point: MergingIter::new(&BYTEWISE, iters),
            rangedels: fragment_all(
                &BYTEWISE,
                mems.iter().flat_map(|m| m.rangedel_iter()).collect(),
            ),
            rangekeys: fragment_all(
                &BYTEWISE,
                mems.iter().flat_map(|m| m.rangekey_iter()).collect(),
            ),
        }
    }

    fn mem_with(build: impl FnOnce(&mut Batch), seq: u64) -> Arc<Memtable> {
        let mem = Arc::new(Memtable::new(&BYTEWISE, 1 << 20, 1));
        let mut batch = Batch::new();
        build(&mut batch);
        mem.add(&batch, seq).unwrap();
        mem
    }

    fn read_all(dir: &TempDir, meta: &FileMetadata) -> Vec<(InternalKey, Vec<u8>)> {
        let reader = Arc::new(
            TableReader::open(&BYTEWISE, sst_path(dir.path(), meta.num)).unwrap(),
        );
        let mut iter = reader.iter();
        let mut out = Vec::new();
        iter.first().unwrap();
        while iter.valid() {
            out.push((iter.key().clone(), iter.value().to_vec()));
            iter.next().unwrap();
        }
        out
    }

    #[test]
    fn newest_version_survives_without_snapshots() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.set(b"k", b"old").unwrap(), 5);
        let m2 = mem_with(|b| b.set(b"k", b"new").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], false), input_from(&[m1, m2])).unwrap();
        assert_eq!(outputs.len(), 1);
        let entries = read_all(&dir, &outputs[0]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.seq(), 9);
        assert_eq!(entries[0].1, b"new");
    }

    #[test]
    fn snapshot_pins_older_version() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.set(b"k", b"old").unwrap(), 5);
        let m2 = mem_with(|b| b.set(b"k", b"new").unwrap(), 9);

        // A snapshot at 6 must keep the value it can see.
        let outputs =
            run_compaction(&params(&dir, &nums, vec![6], false), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.seq(), 9);
        assert_eq!(entries[1].0.seq(), 5);
    }

    #[test]
    fn bottommost_elides_tombstones() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.set(b"k", b"v").unwrap(), 5);
        let m2 = mem_with(|b| b.delete(b"k").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], true), input_from(&[m1, m2])).unwrap();
        // Delete and its shadowed set both vanish; no output file remains.
        assert!(outputs.is_empty());
    }

    #[test]
    fn non_bottommost_keeps_tombstones() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.set(b"k", b"v").unwrap(), 5);
        let m2 = mem_with(|b| b.delete(b"k").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], false), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.kind(), KeyKind::Delete);
    }

    #[test]
    fn set_over_delete_promotes_to_set_with_delete() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.delete(b"k").unwrap(), 5);
        let m2 = mem_with(|b| b.set(b"k", b"new").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], false), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        // The surviving set absorbs the dropped delete and records that it
        // still shadows state below this compaction.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.kind(), KeyKind::SetWithDelete);
        assert_eq!(entries[0].0.seq(), 9);
        assert_eq!(entries[0].1, b"new");

        // At the bottommost level nothing sits below; the set stays plain.
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.delete(b"k").unwrap(), 5);
        let m2 = mem_with(|b| b.set(b"k", b"new").unwrap(), 9);
        let outputs =
            run_compaction(&params(&dir, &nums, vec![], true), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.kind(), KeyKind::Set);
    }

    #[test]
    fn snapshot_blocks_set_with_delete_promotion() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.delete(b"k").unwrap(), 5);
        let m2 = mem_with(|b| b.set(b"k", b"new").unwrap(), 9);

        // A snapshot between the delete and the set keeps the delete; the
        // set shadows nothing and stays plain.
        let outputs =
            run_compaction(&params(&dir, &nums, vec![6], false), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.kind(), KeyKind::Set);
        assert_eq!(entries[1].0.kind(), KeyKind::Delete);
    }

    #[test]
    fn rangedel_drops_same_stripe_data() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(
            |b| {
                b.set(b"a", b"1").unwrap();
                b.set(b"b", b"1").unwrap();
            },
            5,
        );
        let m2 = mem_with(|b| b.delete_range(b"a", b"b").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], false), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        // "a" is covered and dropped; "b" is outside the tombstone.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.user_key, b"b");
        // The tombstone itself survives for deeper levels.
        let reader = Arc::new(
            TableReader::open(&BYTEWISE, sst_path(dir.path(), outputs[0].num)).unwrap(),
        );
        assert_eq!(reader.rangedel_spans().len(), 1);
    }

    #[test]
    fn snapshot_protects_data_under_rangedel() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.set(b"a", b"1").unwrap(), 5);
        let m2 = mem_with(|b| b.delete_range(b"a", b"b").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![6], false), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        // The snapshot at 6 sees a=1; it must survive.
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.user_key, b"a");
    }

    #[test]
    fn merges_collapse_within_stripe() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.set(b"k", b"base.").unwrap(), 3);
        let m2 = mem_with(|b| b.merge(b"k", b"m1.").unwrap(), 5);
        let m3 = mem_with(|b| b.merge(b"k", b"m2.").unwrap(), 7);

        let outputs = run_compaction(
            &params(&dir, &nums, vec![], false),
            input_from(&[m1, m2, m3]),
        )
        .unwrap();
        let entries = read_all(&dir, &outputs[0]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.kind(), KeyKind::Set);
        assert_eq!(entries[0].1, b"base.m1.m2.");
        // The folded record keeps the newest operand's seq.
        assert_eq!(entries[0].0.seq(), 7);
    }

    #[test]
    fn merge_without_base_stays_mergeable() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.merge(b"k", b"x").unwrap(), 5);
        let m2 = mem_with(|b| b.merge(b"k", b"y").unwrap(), 7);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], false), input_from(&[m1, m2])).unwrap();
        let entries = read_all(&dir, &outputs[0]);
        assert_eq!(entries.len(), 1);
        // Still a merge: a base set may live in a deeper level.
        assert_eq!(entries[0].0.kind(), KeyKind::Merge);
        assert_eq!(entries[0].1, b"xy");
    }

    #[test]
    fn single_delete_annihilates_set() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(|b| b.set(b"k", b"v").unwrap(), 5);
        let m2 = mem_with(|b| b.single_delete(b"k").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], false), input_from(&[m1, m2])).unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn output_splits_at_user_key_boundaries() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let mem = Arc::new(Memtable::new(&BYTEWISE, 4 << 20, 1));
        let mut batch = Batch::new();
        let filler = vec![b'v'; 1024];
        for i in 0..64u64 {
            batch.set(format!("key{i:04}").as_bytes(), &filler).unwrap();
        }
        mem.add(&batch, 1).unwrap();

        let mut p = params(&dir, &nums, vec![], false);
        p.target_file_size = 8 * 1024;
        let outputs = run_compaction(&p, input_from(&[mem])).unwrap();
        assert!(outputs.len() > 1, "expected multiple outputs");
        // Outputs are disjoint and ordered.
        for pair in outputs.windows(2) {
            assert!(
                BYTEWISE.cmp(&pair[0].largest.user_key, &pair[1].smallest.user_key)
                    == std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn straddling_rangedel_is_clipped_per_output() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let mem = Arc::new(Memtable::new(&BYTEWISE, 4 << 20, 1));
        let mut batch = Batch::new();
        let filler = vec![b'v'; 1024];
        for i in 0..32u64 {
            batch.set(format!("key{i:04}").as_bytes(), &filler).unwrap();
        }
        // Tombstone over the whole key space, newer data untouched by it.
        batch.delete_range(b"key", b"kez").unwrap();
        mem.add(&batch, 1).unwrap();
        // A snapshot between the sets and the tombstone keeps the covered
        // sets alive so every output is non-empty.
        let mut p = params(&dir, &nums, vec![32], false);
        p.target_file_size = 8 * 1024;

        let outputs = run_compaction(&p, input_from(&[mem])).unwrap();
        assert!(outputs.len() > 1);
        for (i, meta) in outputs.iter().enumerate() {
            let reader = Arc::new(
                TableReader::open(&BYTEWISE, sst_path(dir.path(), meta.num)).unwrap(),
            );
            let spans = reader.rangedel_spans();
            assert_eq!(spans.len(), 1, "output {i} carries its clipped fragment");
            if i + 1 < outputs.len() {
                // Interior outputs end in the sentinel bound.
                assert!(meta.largest_is_exclusive());
                assert_eq!(meta.largest.user_key, outputs[i + 1].smallest.user_key);
            }
        }
        // Clipped fragments tile the original tombstone without overlap.
        for pair in outputs.windows(2) {
            assert!(
                BYTEWISE.cmp(&pair[0].largest.user_key, &pair[1].smallest.user_key)
                    != std::cmp::Ordering::Greater
            );
        }
    }

    #[test]
    fn rangekey_unset_applies_at_bottommost() {
        let dir = TempDir::new().unwrap();
        let nums = AtomicU64::new(1);
        let m1 = mem_with(
            |b| b.range_key_set(b"a", b"z", b"@3", b"val").unwrap(),
            5,
        );
        let m2 = mem_with(|b| b.range_key_unset(b"a", b"z", b"@3").unwrap(), 9);

        let outputs =
            run_compaction(&params(&dir, &nums, vec![], true), input_from(&[m1, m2])).unwrap();
        assert!(outputs.is_empty());

        // Non-bottommost keeps the unset for deeper levels.
        let dir2 = TempDir::new().unwrap();
        let nums2 = AtomicU64::new(1);
        let m1 = mem_with(
            |b| b.range_key_set(b"a", b"z", b"@3", b"val").unwrap(),
            5,
        );
        let m2 = mem_with(|b| b.range_key_unset(b"a", b"z", b"@3").unwrap(), 9);
        let outputs =
            run_compaction(&params(&dir2, &nums2, vec![], false), input_from(&[m1, m2]))
                .unwrap();
        assert_eq!(outputs.len(), 1);
        let reader = Arc::new(
            TableReader::open(&BYTEWISE, sst_path(dir2.path(), outputs[0].num)).unwrap(),
        );
        let spans = reader.rangekey_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].keys.len(), 1);
        assert_eq!(spans[0].keys[0].kind(), KeyKind::RangeKeyUnset);
    }
}
