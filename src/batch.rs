//! Write batches.
//!
//! A batch is an ordered log of mutations encoded into a single buffer:
//! `[count: u32][seq: u64][record]*` with each record
//! `[kind: u8][key varstr][value varstr?]`. The count covers
//! seq-consuming records; `log_data` payloads ride along without consuming
//! a sequence number. An indexed batch additionally maintains a skiplist
//! from internal keys to record offsets so iterators can merge uncommitted
//! state with the database.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_skiplist::SkipMap;

use crate::comparator::Comparator;
use crate::errcorrupt;
use crate::error::Result;
use crate::key::{
    make_trailer, read_varstr, write_varstr, InternalKey, KeyKind,
};
use crate::keyspan::{fragment_all, Span, SpanKey};
use crate::memtable::MapKey;
use crate::Error;

pub use crate::key::BATCH_SEQ_BASE;

/// Whether records of `kind` carry a value varstr in the batch encoding.
fn record_has_value(kind: KeyKind) -> bool {
    !matches!(
        kind,
        KeyKind::Delete | KeyKind::SingleDelete | KeyKind::LogData | KeyKind::IngestSst
    )
}

pub struct Batch {
    /// Concatenated records, without the count/seq header.
    buf: Vec<u8>,
    /// Number of seq-consuming records.
    count: u32,
    /// Skiplist over point records for indexed batches.
    index: Option<SkipMap<MapKey, usize>>,
    cmp: Option<&'static Comparator>,
    committed: AtomicBool,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            count: 0,
            index: None,
            cmp: None,
            committed: AtomicBool::new(false),
        }
    }

    /// A batch that indexes its point records for read-your-writes
    /// iteration.
    pub fn new_indexed(cmp: &'static Comparator) -> Self {
        Self {
            index: Some(SkipMap::new()),
            cmp: Some(cmp),
            ..Self::new()
        }
    }

    /// Number of seq-consuming records.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Approximate bytes the batch will occupy in a memtable.
    pub fn memtable_size(&self) -> usize {
        self.buf.len() + self.count as usize * 24
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Marks the batch applied. A batch commits at most once.
    pub(crate) fn mark_committed(&self) -> Result<()> {
        if self.committed.swap(true, Ordering::AcqRel) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn push_record(&mut self, kind: KeyKind, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        if self.is_committed() {
            return Err(Error::ReadOnly);
        }
        let offset = self.buf.len();
        self.buf.push(kind as u8);
        write_varstr(&mut self.buf, key)?;
        if let Some(v) = value {
            write_varstr(&mut self.buf, v)?;
        }
        let consumes_seq = kind != KeyKind::LogData;
        if consumes_seq {
            if let (Some(index), Some(cmp)) = (&self.index, self.cmp) {
                if !kind.is_range_key()
                    && !matches!(kind, KeyKind::RangeDelete | KeyKind::IngestSst)
                {
                    let ikey = InternalKey::new(key, BATCH_SEQ_BASE + self.count as u64, kind);
                    index.insert(MapKey::new(cmp, ikey), offset);
                }
            }
            self.count += 1;
        }
        Ok(())
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.push_record(KeyKind::Set, key, Some(value))
    }

    pub fn merge(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.push_record(KeyKind::Merge, key, Some(value))
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.push_record(KeyKind::Delete, key, None)
    }

    pub fn single_delete(&mut self, key: &[u8]) -> Result<()> {
        self.push_record(KeyKind::SingleDelete, key, None)
    }

    /// Delete with a hint of the size of the value it is expected to
    /// shadow, used by compaction heuristics.
    pub fn delete_sized(&mut self, key: &[u8], size_hint: u64) -> Result<()> {
        let mut hint = Vec::with_capacity(8);
        hint.write_u64::<BigEndian>(size_hint)?;
        self.push_record(KeyKind::DeleteSized, key, Some(&hint))
    }

    /// Hides every point key in `[start, end)` older than the tombstone.
    pub fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.push_record(KeyKind::RangeDelete, start, Some(end))
    }

    /// Sets a range key over `[start, end)` at `suffix`.
    pub fn range_key_set(
        &mut self,
        start: &[u8],
        end: &[u8],
        suffix: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut payload = Vec::new();
        write_varstr(&mut payload, end)?;
        write_varstr(&mut payload, suffix)?;
        write_varstr(&mut payload, value)?;
        self.push_record(KeyKind::RangeKeySet, start, Some(&payload))
    }

    /// Removes range keys with exactly `suffix` over `[start, end)`.
    pub fn range_key_unset(&mut self, start: &[u8], end: &[u8], suffix: &[u8]) -> Result<()> {
        let mut payload = Vec::new();
        write_varstr(&mut payload, end)?;
        write_varstr(&mut payload, suffix)?;
        self.push_record(KeyKind::RangeKeyUnset, start, Some(&payload))
    }

    /// Removes all range keys over `[start, end)`.
    pub fn range_key_delete(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.push_record(KeyKind::RangeKeyDelete, start, Some(end))
    }

    /// Opaque payload written to the WAL without becoming a visible key.
    pub fn log_data(&mut self, data: &[u8]) -> Result<()> {
        self.push_record(KeyKind::LogData, data, None)
    }

    /// Routes pre-built sstables through the commit pipeline. Must be the
    /// batch's only record.
    pub fn ingest_sst(&mut self, paths: &[&str]) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::InvalidArgument(
                "ingest_sst must be a batch's only record".into(),
            ));
        }
        let joined = paths.join("\0");
        self.push_record(KeyKind::IngestSst, joined.as_bytes(), None)
    }

    /// Whether the batch consists of a single `ingest_sst` record; returns
    /// the paths when so.
    pub fn as_ingest(&self) -> Option<Vec<String>> {
        let mut records = self.records();
        let first = records.next()?;
        if first.kind != KeyKind::IngestSst || records.next().is_some() {
            return None;
        }
        Some(
            String::from_utf8_lossy(first.key)
                .split('\0')
                .map(str::to_string)
                .collect(),
        )
    }

    /// Encodes the wire format with `seq` stamped into the header.
    pub fn encode(&self, seq: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.buf.len());
        out.write_u32::<BigEndian>(self.count).unwrap();
        out.write_u64::<BigEndian>(seq).unwrap();
        out.extend_from_slice(&self.buf);
        out
    }

    /// Decodes a wire-format batch into its header seq and a replayable
    /// batch.
    pub fn decode(data: &[u8]) -> Result<(u64, Batch)> {
        let mut cursor = Cursor::new(data);
        let count = cursor.read_u32::<BigEndian>()?;
        let seq = cursor.read_u64::<BigEndian>()?;
        let buf = data[cursor.position() as usize..].to_vec();
        let batch = Batch {
            buf,
            count,
            index: None,
            cmp: None,
            committed: AtomicBool::new(false),
        };
        // Validate the record stream and the count up front.
        let mut consumed = 0u32;
        for rec in batch.records_checked() {
            let rec = rec?;
            if rec.kind != KeyKind::LogData {
                consumed += 1;
            }
        }
        if consumed != count {
            return errcorrupt!("batch header count {count} != records {consumed}");
        }
        Ok((seq, batch))
    }

    /// Iterates the records with their seq offsets. Panics on a malformed
    /// buffer; use [`Batch::records_checked`] for untrusted input.
    pub fn records(&self) -> impl Iterator<Item = BatchRecord<'_>> {
        self.records_checked().map(|r| r.expect("batch buffer is well formed"))
    }

    pub fn records_checked(&self) -> BatchRecords<'_> {
        BatchRecords {
            buf: &self.buf,
            pos: 0,
            seq_offset: 0,
        }
    }

    /// Range tombstones in this batch as fragmented spans at
    /// `base_seq + offset`.
    pub fn rangedel_spans(&self, cmp: &Comparator, base_seq: u64) -> Vec<Span> {
        let spans = self
            .records()
            .filter(|r| r.kind == KeyKind::RangeDelete)
            .map(|r| {
                Span::new(
                    r.key.to_vec(),
                    r.value.to_vec(),
                    vec![SpanKey::new(
                        make_trailer(base_seq + r.seq_offset as u64, KeyKind::RangeDelete),
                        Vec::new(),
                        Vec::new(),
                    )],
                )
            })
            .collect();
        fragment_all(cmp, spans)
    }

    /// Range-key records in this batch as fragmented spans at
    /// `base_seq + offset`.
    pub fn rangekey_spans(&self, cmp: &Comparator, base_seq: u64) -> Vec<Span> {
        let spans = self
            .records()
            .filter(|r| r.kind.is_range_key())
            .map(|r| {
                let (end, suffix, value) = decode_range_key_payload(r.kind, r.value)
                    .expect("batch buffer is well formed");
                Span::new(
                    r.key.to_vec(),
                    end,
                    vec![SpanKey::new(
                        make_trailer(base_seq + r.seq_offset as u64, r.kind),
                        suffix,
                        value,
                    )],
                )
            })
            .collect();
        fragment_all(cmp, spans)
    }

    /// An iterator over the indexed point records, merging into the read
    /// path above all committed state.
    pub fn index_iter(&self) -> Option<BatchIter<'_>> {
        let index = self.index.as_ref()?;
        Some(BatchIter {
            batch: self,
            index,
            cmp: self.cmp.expect("indexed batches carry a comparator"),
            current: None,
        })
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes the `(end, suffix, value)` payload of a range-key record.
pub fn decode_range_key_payload(kind: KeyKind, value: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    match kind {
        KeyKind::RangeKeySet => {
            let mut cursor = Cursor::new(value);
            let end = read_varstr(&mut cursor)?;
            let suffix = read_varstr(&mut cursor)?;
            let val = read_varstr(&mut cursor)?;
            Ok((end, suffix, val))
        }
        KeyKind::RangeKeyUnset => {
            let mut cursor = Cursor::new(value);
            let end = read_varstr(&mut cursor)?;
            let suffix = read_varstr(&mut cursor)?;
            Ok((end, suffix, Vec::new()))
        }
        KeyKind::RangeKeyDelete | KeyKind::RangeDelete => {
            Ok((value.to_vec(), Vec::new(), Vec::new()))
        }
        _ => errcorrupt!("{kind:?} carries no range payload"),
    }
}

/// A decoded batch record. `seq_offset` is the record's position among the
/// batch's seq-consuming records.
#[derive(Debug, Clone, Copy)]
pub struct BatchRecord<'a> {
    pub kind: KeyKind,
    pub key: &'a [u8],
    pub value: &'a [u8],
    pub seq_offset: u32,
}

pub struct BatchRecords<'a> {
    buf: &'a [u8],
    pos: usize,
    seq_offset: u32,
}

impl<'a> BatchRecords<'a> {
    fn read_record(&mut self) -> Result<BatchRecord<'a>> {
        let mut cursor = Cursor::new(&self.buf[self.pos..]);
        let kind = KeyKind::from_u8(cursor.read_u8()?)?;

        let key_len = cursor.read_u32::<BigEndian>()? as usize;
        let key_start = self.pos + cursor.position() as usize;
        let key_end = key_start + key_len;
        if key_end > self.buf.len() {
            return errcorrupt!("batch record key overruns buffer");
        }
        let key = &self.buf[key_start..key_end];

        let (value, end) = if record_has_value(kind) {
            let mut cursor = Cursor::new(&self.buf[key_end..]);
            let value_len = cursor.read_u32::<BigEndian>()? as usize;
            let value_start = key_end + 4;
            let value_end = value_start + value_len;
            if value_end > self.buf.len() {
                return errcorrupt!("batch record value overruns buffer");
            }
            (&self.buf[value_start..value_end], value_end)
        } else {
            (&self.buf[key_end..key_end], key_end)
        };

        self.pos = end;
        let seq_offset = self.seq_offset;
        if kind != KeyKind::LogData {
            self.seq_offset += 1;
        }
        Ok(BatchRecord {
            kind,
            key,
            value,
            seq_offset,
        })
    }
}

impl<'a> Iterator for BatchRecords<'a> {
    type Item = Result<BatchRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        Some(self.read_record())
    }
}

/// Iterator over an indexed batch's point records, in internal-key order.
pub struct BatchIter<'a> {
    batch: &'a Batch,
    index: &'a SkipMap<MapKey, usize>,
    cmp: &'static Comparator,
    current: Option<(InternalKey, Vec<u8>)>,
}

impl<'a> BatchIter<'a> {
    fn load(&self, key: &MapKey, offset: usize) -> (InternalKey, Vec<u8>) {
        let mut records = BatchRecords {
            buf: &self.batch.buf[offset..],
            pos: 0,
            seq_offset: 0,
        };
        let rec = records
            .read_record()
            .expect("indexed offsets point at valid records");
        (key.key().clone(), rec.value.to_vec())
    }

    fn bound(&self, key: InternalKey) -> MapKey {
        MapKey::new(self.cmp, key)
    }
}

impl<'a> crate::iterator::InternalIterator for BatchIter<'a> {
    fn first(&mut self) -> Result<()> {
        self.current = self.index.front().map(|e| self.load(e.key(), *e.value()));
        Ok(())
    }

    fn last(&mut self) -> Result<()> {
        self.current = self.index.back().map(|e| self.load(e.key(), *e.value()));
        Ok(())
    }

    fn seek_ge(&mut self, user_key: &[u8]) -> Result<()> {
        let bound = self.bound(InternalKey::range_end_sentinel(user_key));
        self.current = self
            .index
            .range(bound..)
            .next()
            .map(|e| self.load(e.key(), *e.value()));
        Ok(())
    }

    fn seek_lt(&mut self, user_key: &[u8]) -> Result<()> {
        let bound = self.bound(InternalKey::range_end_sentinel(user_key));
        self.current = self
            .index
            .range(..bound)
            .next_back()
            .map(|e| self.load(e.key(), *e.value()));
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let cur = self.current.take().expect("next on invalid iterator");
        let bound = self.bound(cur.0);
        self.current = self
            .index
            .range((std::ops::Bound::Excluded(bound), std::ops::Bound::Unbounded))
            .next()
            .map(|e| self.load(e.key(), *e.value()));
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        let cur = self.current.take().expect("prev on invalid iterator");
        let bound = self.bound(cur.0);
        self.current = self
            .index
            .range(..bound)
            .next_back()
            .map(|e| self.load(e.key(), *e.value()));
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BYTEWISE;
    use crate::iterator::InternalIterator;

    #[test]
    fn records_roundtrip_in_order() {
        let mut b = Batch::new();
        b.set(b"a", b"1").unwrap();
        b.delete(b"b").unwrap();
        b.merge(b"c", b"2").unwrap();
        b.log_data(b"note").unwrap();
        b.delete_range(b"d", b"g").unwrap();

        let records: Vec<_> = b.records().collect();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].kind, KeyKind::Set);
        assert_eq!(records[0].key, b"a");
        assert_eq!(records[0].value, b"1");
        assert_eq!(records[1].kind, KeyKind::Delete);
        assert_eq!(records[1].value, b"");
        assert_eq!(records[3].kind, KeyKind::LogData);
        assert_eq!(records[3].key, b"note");
        assert_eq!(records[4].kind, KeyKind::RangeDelete);
        assert_eq!(records[4].value, b"g");

        // LogData consumes no sequence number.
        assert_eq!(b.count(), 4);
        assert_eq!(records[3].seq_offset, 3);
        assert_eq!(records[4].seq_offset, 3);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut b = Batch::new();
        b.set(b"k", b"v").unwrap();
        b.range_key_set(b"a", b"c", b"@5", b"boop").unwrap();

        let encoded = b.encode(77);
        let (seq, decoded) = Batch::decode(&encoded).unwrap();
        assert_eq!(seq, 77);
        assert_eq!(decoded.count(), 2);

        let records: Vec<_> = decoded.records().collect();
        assert_eq!(records[1].kind, KeyKind::RangeKeySet);
        let (end, suffix, value) =
            decode_range_key_payload(KeyKind::RangeKeySet, records[1].value).unwrap();
        assert_eq!(end, b"c");
        assert_eq!(suffix, b"@5");
        assert_eq!(value, b"boop");
    }

    #[test]
    fn decode_rejects_count_mismatch() {
        let mut b = Batch::new();
        b.set(b"k", b"v").unwrap();
        let mut encoded = b.encode(1);
        encoded[3] = 9; // corrupt the count
        assert!(matches!(
            Batch::decode(&encoded),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn commit_is_once() {
        let b = Batch::new();
        b.mark_committed().unwrap();
        assert!(matches!(b.mark_committed(), Err(Error::ReadOnly)));
    }

    #[test]
    fn mutation_after_commit_fails() {
        let mut b = Batch::new();
        b.set(b"a", b"1").unwrap();
        b.mark_committed().unwrap();
        assert!(matches!(b.set(b"b", b"2"), Err(Error::ReadOnly)));
    }

    #[test]
    fn ingest_must_be_alone() {
        let mut b = Batch::new();
        b.set(b"a", b"1").unwrap();
        assert!(b.ingest_sst(&["x.sst"]).is_err());

        let mut b = Batch::new();
        b.ingest_sst(&["x.sst", "y.sst"]).unwrap();
        assert_eq!(b.as_ingest().unwrap(), vec!["x.sst", "y.sst"]);
    }

    #[test]
    fn rangedel_spans_fragment() {
        let mut b = Batch::new();
        b.delete_range(b"a", b"d").unwrap();
        b.delete_range(b"b", b"f").unwrap();
        let spans = b.rangedel_spans(&BYTEWISE, 10);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[1].keys.len(), 2);
        assert_eq!(spans[1].keys[0].seq(), 11);
    }

    #[test]
    fn indexed_batch_iterates_points_in_order() {
        let mut b = Batch::new_indexed(&BYTEWISE);
        b.set(b"c", b"3").unwrap();
        b.set(b"a", b"1").unwrap();
        b.delete(b"b").unwrap();

        let mut iter = b.index_iter().unwrap();
        iter.first().unwrap();
        assert!(iter.valid());
        assert_eq!(iter.key().user_key, b"a");
        assert_eq!(iter.value(), b"1");
        iter.next().unwrap();
        assert_eq!(iter.key().user_key, b"b");
        assert_eq!(iter.key().kind(), KeyKind::Delete);
        iter.next().unwrap();
        assert_eq!(iter.key().user_key, b"c");
        iter.next().unwrap();
        assert!(!iter.valid());

        // Later writes to the same key shadow earlier ones.
        let mut b = Batch::new_indexed(&BYTEWISE);
        b.set(b"k", b"old").unwrap();
        b.set(b"k", b"new").unwrap();
        let mut iter = b.index_iter().unwrap();
        iter.seek_ge(b"k").unwrap();
        assert_eq!(iter.value(), b"new");
    }
}
