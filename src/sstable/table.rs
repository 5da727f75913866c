//! SSTable reading and writing.
//!
//! ## File layout
//!
//! ```text
//! +--------------------+
//! | Data Block 1..N    |  point entries
//! +--------------------+
//! | Range-del Block    |  fragmented tombstone spans
//! +--------------------+
//! | Range-key Block    |  fragmented range-key spans
//! +--------------------+
//! | Index Block        |  first key -> (offset, len) per data block
//! +--------------------+
//! | Properties Block   |  bounds, counts, seq range
//! +--------------------+
//! | Footer             |  section offsets, format version, magic
//! +--------------------+
//! ```
//!
//! Every block ends with a CRC32 of its contents. The footer's format
//! version gates readability: a version above [`FORMAT_VERSION`] surfaces
//! `TableFormatUnsupported`.

use std::cmp::Ordering as CmpOrdering;
use std::fs::File;
use std::io::{Cursor, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::block::{decode_block, BlockBuilder, BLOCK_SIZE};
use crate::comparator::Comparator;
use crate::errcorrupt;
use crate::errinput;
use crate::error::Result;
use crate::iterator::InternalIterator;
use crate::key::{
    make_trailer, read_varstr, write_varstr, InternalKey, KeyKind, SEQ_INF,
};
use crate::keyspan::{Span, SpanKey};
use crate::Error;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const MAGIC: u64 = 0xc1d3_6b5a_7e01_44aa;

/// Current table format major version.
pub const FORMAT_VERSION: u32 = 1;

/// Formats the name of an sstable inside the database directory.
pub fn sst_path(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("{num:06}.sst"))
}

/// Table-wide properties persisted in the properties block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableProps {
    pub num_entries: u64,
    pub num_rangedels: u64,
    pub num_rangekeys: u64,
    pub smallest_point: Option<InternalKey>,
    pub largest_point: Option<InternalKey>,
    pub smallest_range: Option<InternalKey>,
    pub largest_range: Option<InternalKey>,
    pub smallest_seq: u64,
    pub largest_seq: u64,
    pub format_version: u32,
}

impl TableProps {
    /// Smallest internal key across point and range families.
    pub fn smallest(&self, cmp: &Comparator) -> Option<InternalKey> {
        match (&self.smallest_point, &self.smallest_range) {
            (Some(p), Some(r)) => Some(if p.cmp_with(cmp, r) == CmpOrdering::Less {
                p.clone()
            } else {
                r.clone()
            }),
            (Some(p), None) => Some(p.clone()),
            (None, Some(r)) => Some(r.clone()),
            (None, None) => None,
        }
    }

    /// Largest internal key across point and range families.
    pub fn largest(&self, cmp: &Comparator) -> Option<InternalKey> {
        match (&self.largest_point, &self.largest_range) {
            (Some(p), Some(r)) => Some(if p.cmp_with(cmp, r) == CmpOrdering::Greater {
                p.clone()
            } else {
                r.clone()
            }),
            (Some(p), None) => Some(p.clone()),
            (None, Some(r)) => Some(r.clone()),
            (None, None) => None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        fn opt_key(buf: &mut Vec<u8>, key: &Option<InternalKey>) {
            match key {
                Some(k) => {
                    buf.push(1);
                    k.encode_into(buf).unwrap();
                }
                None => buf.push(0),
            }
        }
        let mut buf = Vec::new();
        buf.write_u64::<BigEndian>(self.num_entries).unwrap();
        buf.write_u64::<BigEndian>(self.num_rangedels).unwrap();
        buf.write_u64::<BigEndian>(self.num_rangekeys).unwrap();
        opt_key(&mut buf, &self.smallest_point);
        opt_key(&mut buf, &self.largest_point);
        opt_key(&mut buf, &self.smallest_range);
        opt_key(&mut buf, &self.largest_range);
        buf.write_u64::<BigEndian>(self.smallest_seq).unwrap();
        buf.write_u64::<BigEndian>(self.largest_seq).unwrap();
        buf.write_u32::<BigEndian>(self.format_version).unwrap();
        buf
    }

    fn decode(data: &[u8]) -> Result<Self> {
        fn opt_key(cursor: &mut Cursor<&[u8]>) -> Result<Option<InternalKey>> {
            Ok(match cursor.read_u8()? {
                0 => None,
                _ => Some(InternalKey::decode_from(cursor)?),
            })
        }
        let mut cursor = Cursor::new(data);
        Ok(Self {
            num_entries: cursor.read_u64::<BigEndian>()?,
            num_rangedels: cursor.read_u64::<BigEndian>()?,
            num_rangekeys: cursor.read_u64::<BigEndian>()?,
            smallest_point: opt_key(&mut cursor)?,
            largest_point: opt_key(&mut cursor)?,
            smallest_range: opt_key(&mut cursor)?,
            largest_range: opt_key(&mut cursor)?,
            smallest_seq: cursor.read_u64::<BigEndian>()?,
            largest_seq: cursor.read_u64::<BigEndian>()?,
            format_version: cursor.read_u32::<BigEndian>()?,
        })
    }
}

fn encode_spans(spans: &[Span]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<BigEndian>(spans.len() as u32).unwrap();
    for span in spans {
        write_varstr(&mut buf, &span.start).unwrap();
        write_varstr(&mut buf, &span.end).unwrap();
        buf.write_u32::<BigEndian>(span.keys.len() as u32).unwrap();
        for key in &span.keys {
            buf.write_u64::<BigEndian>(key.trailer).unwrap();
            write_varstr(&mut buf, &key.suffix).unwrap();
            write_varstr(&mut buf, &key.value).unwrap();
        }
    }
    buf
}

fn decode_spans(data: &[u8]) -> Result<Vec<Span>> {
    let mut cursor = Cursor::new(data);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut spans = Vec::with_capacity(count);
    for _ in 0..count {
        let start = read_varstr(&mut cursor)?;
        let end = read_varstr(&mut cursor)?;
        let key_count = cursor.read_u32::<BigEndian>()? as usize;
        let mut keys = Vec::with_capacity(key_count);
        for _ in 0..key_count {
            let trailer = cursor.read_u64::<BigEndian>()?;
            let suffix = read_varstr(&mut cursor)?;
            let value = read_varstr(&mut cursor)?;
            keys.push(SpanKey::new(trailer, suffix, value));
        }
        spans.push(Span::new(start, end, keys));
    }
    Ok(spans)
}

/// Builds an sstable. Point entries must arrive in ascending internal-key
/// order; spans must be pre-fragmented and start-ordered per family.
pub struct TableWriter {
    cmp: &'static Comparator,
    file: File,
    path: PathBuf,
    offset: u64,
    block: BlockBuilder,
    /// `(first key, offset, len)` per finished data block.
    index: Vec<(InternalKey, u64, u32)>,
    pending_first: Option<InternalKey>,
    rangedels: Vec<Span>,
    rangekeys: Vec<Span>,
    props: TableProps,
    last_point: Option<InternalKey>,
}

impl TableWriter {
    pub fn new(cmp: &'static Comparator, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            cmp,
            file,
            path,
            offset: 0,
            block: BlockBuilder::new(),
            index: Vec::new(),
            pending_first: None,
            rangedels: Vec::new(),
            rangekeys: Vec::new(),
            props: TableProps {
                smallest_seq: u64::MAX,
                format_version: FORMAT_VERSION,
                ..TableProps::default()
            },
            last_point: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.block.len() as u64
    }

    fn note_seq(&mut self, seq: u64) {
        self.props.smallest_seq = self.props.smallest_seq.min(seq);
        self.props.largest_seq = self.props.largest_seq.max(seq);
    }

    /// Appends a point entry.
    pub fn add(&mut self, key: &InternalKey, value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_point {
            if last.cmp_with(self.cmp, key) != CmpOrdering::Less {
                return errinput!("point keys must be added in ascending order");
            }
        }
        if self.pending_first.is_none() {
            self.pending_first = Some(key.clone());
        }
        self.block.add(key, value);
        self.note_seq(key.seq());
        if self.props.smallest_point.is_none() {
            self.props.smallest_point = Some(key.clone());
        }
        self.props.largest_point = Some(key.clone());
        self.props.num_entries += 1;
        self.last_point = Some(key.clone());

        if self.block.len() >= BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    fn write_block(&mut self, data: &[u8]) -> Result<(u64, u32)> {
        let offset = self.offset;
        self.file.write_all(data)?;
        let mut crc = Vec::with_capacity(4);
        crc.write_u32::<BigEndian>(CRC32.checksum(data))?;
        self.file.write_all(&crc)?;
        self.offset += data.len() as u64 + 4;
        Ok((offset, data.len() as u32 + 4))
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block = std::mem::take(&mut self.block);
        let data = block.finish();
        let (offset, len) = self.write_block(&data)?;
        let first = self
            .pending_first
            .take()
            .expect("non-empty block has a first key");
        self.index.push((first, offset, len));
        Ok(())
    }

    fn note_span_bounds(&mut self, span: &Span) {
        let smallest = InternalKey {
            user_key: span.start.clone(),
            trailer: span.keys.first().map(|k| k.trailer).unwrap_or(0),
        };
        let largest = InternalKey::range_end_sentinel(span.end.clone());
        match &self.props.smallest_range {
            Some(cur) if smallest.cmp_with(self.cmp, cur) != CmpOrdering::Less => {}
            _ => self.props.smallest_range = Some(smallest),
        }
        match &self.props.largest_range {
            Some(cur) if largest.cmp_with(self.cmp, cur) != CmpOrdering::Greater => {}
            _ => self.props.largest_range = Some(largest),
        }
        for key in &span.keys {
            self.note_seq(key.seq());
        }
    }

    /// Appends a fragmented range tombstone span.
    pub fn add_rangedel_span(&mut self, span: Span) -> Result<()> {
        if let Some(last) = self.rangedels.last() {
            if self.cmp.cmp(&span.start, &last.end) == CmpOrdering::Less {
                return errinput!("range tombstone spans must be ordered and disjoint");
            }
        }
        self.note_span_bounds(&span);
        self.props.num_rangedels += span.keys.len() as u64;
        self.rangedels.push(span);
        Ok(())
    }

    /// Appends a fragmented range-key span.
    pub fn add_rangekey_span(&mut self, span: Span) -> Result<()> {
        if let Some(last) = self.rangekeys.last() {
            if self.cmp.cmp(&span.start, &last.end) == CmpOrdering::Less {
                return errinput!("range-key spans must be ordered and disjoint");
            }
        }
        self.note_span_bounds(&span);
        self.props.num_rangekeys += span.keys.len() as u64;
        self.rangekeys.push(span);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.props.num_entries == 0
            && self.props.num_rangedels == 0
            && self.props.num_rangekeys == 0
    }

    /// Writes the trailing sections, fsyncs, and returns the table
    /// properties.
    pub fn finish(mut self) -> Result<TableProps> {
        self.flush_block()?;
        if self.props.smallest_seq == u64::MAX {
            self.props.smallest_seq = 0;
        }

        let rangedel_block = encode_spans(&self.rangedels);
        let (rangedel_off, rangedel_len) = self.write_block(&rangedel_block)?;
        let rangekey_block = encode_spans(&self.rangekeys);
        let (rangekey_off, rangekey_len) = self.write_block(&rangekey_block)?;

        let mut index_block = Vec::new();
        index_block
            .write_u32::<BigEndian>(self.index.len() as u32)
            .unwrap();
        for (first, offset, len) in &self.index {
            first.encode_into(&mut index_block)?;
            index_block.write_u64::<BigEndian>(*offset)?;
            index_block.write_u32::<BigEndian>(*len)?;
        }
        let (index_off, index_len) = self.write_block(&index_block)?;

        let props_block = self.props.encode();
        let (props_off, props_len) = self.write_block(&props_block)?;

        let mut footer = Vec::new();
        footer.write_u64::<BigEndian>(index_off)?;
        footer.write_u32::<BigEndian>(index_len)?;
        footer.write_u64::<BigEndian>(rangedel_off)?;
        footer.write_u32::<BigEndian>(rangedel_len)?;
        footer.write_u64::<BigEndian>(rangekey_off)?;
        footer.write_u32::<BigEndian>(rangekey_len)?;
        footer.write_u64::<BigEndian>(props_off)?;
        footer.write_u32::<BigEndian>(props_len)?;
        footer.write_u32::<BigEndian>(FORMAT_VERSION)?;
        footer.write_u64::<BigEndian>(MAGIC)?;
        self.file.write_all(&footer)?;
        self.file.sync_all()?;

        Ok(self.props)
    }
}

const FOOTER_SIZE: u64 = 4 * 12 + 4 + 8;

/// Random-access reader over an sstable.
///
/// Virtual files open the backing file with `bounds`: an inclusive
/// internal-key window that clamps points and spans. `seq_override` stamps
/// every emitted key with a single sequence number, the mechanism behind
/// ingestion's logical sequence rewriting.
pub struct TableReader {
    cmp: &'static Comparator,
    file: File,
    path: PathBuf,
    index: Vec<(InternalKey, u64, u32)>,
    rangedels: Vec<Span>,
    rangekeys: Vec<Span>,
    props: TableProps,
    bounds: Option<(InternalKey, InternalKey)>,
    seq_override: Option<u64>,
}

impl TableReader {
    pub fn open(cmp: &'static Comparator, path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(cmp, path, None, None)
    }

    pub fn open_with(
        cmp: &'static Comparator,
        path: impl Into<PathBuf>,
        bounds: Option<(InternalKey, InternalKey)>,
        seq_override: Option<u64>,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_SIZE {
            return errcorrupt!("sstable {} shorter than its footer", path.display());
        }

        let mut footer = vec![0u8; FOOTER_SIZE as usize];
        file.read_exact_at(&mut footer, size - FOOTER_SIZE)?;
        let mut cursor = Cursor::new(footer.as_slice());
        let index_off = cursor.read_u64::<BigEndian>()?;
        let index_len = cursor.read_u32::<BigEndian>()?;
        let rangedel_off = cursor.read_u64::<BigEndian>()?;
        let rangedel_len = cursor.read_u32::<BigEndian>()?;
        let rangekey_off = cursor.read_u64::<BigEndian>()?;
        let rangekey_len = cursor.read_u32::<BigEndian>()?;
        let props_off = cursor.read_u64::<BigEndian>()?;
        let props_len = cursor.read_u32::<BigEndian>()?;
        let format_version = cursor.read_u32::<BigEndian>()?;
        let magic = cursor.read_u64::<BigEndian>()?;
        if magic != MAGIC {
            return errcorrupt!("sstable {} bad magic", path.display());
        }
        if format_version > FORMAT_VERSION {
            return Err(Error::TableFormatUnsupported(format_version));
        }

        let read_section = |off: u64, len: u32| -> Result<Vec<u8>> {
            let mut data = vec![0u8; len as usize];
            file.read_exact_at(&mut data, off)?;
            if data.len() < 4 {
                return errcorrupt!("sstable {} truncated block", path.display());
            }
            let body_len = data.len() - 4;
            let stored = Cursor::new(&data[body_len..]).read_u32::<BigEndian>()?;
            if stored != CRC32.checksum(&data[..body_len]) {
                return errcorrupt!("sstable {} block failed checksum", path.display());
            }
            data.truncate(body_len);
            Ok(data)
        };

        let index_data = read_section(index_off, index_len)?;
        let mut cursor = Cursor::new(index_data.as_slice());
        let count = cursor.read_u32::<BigEndian>()? as usize;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let first = InternalKey::decode_from(&mut cursor)?;
            let offset = cursor.read_u64::<BigEndian>()?;
            let len = cursor.read_u32::<BigEndian>()?;
            index.push((first, offset, len));
        }

        let rangedels = decode_spans(&read_section(rangedel_off, rangedel_len)?)?;
        let rangekeys = decode_spans(&read_section(rangekey_off, rangekey_len)?)?;
        let props = TableProps::decode(&read_section(props_off, props_len)?)?;

        let mut reader = Self {
            cmp,
            file,
            path,
            index,
            rangedels,
            rangekeys,
            props,
            bounds,
            seq_override,
        };
        reader.apply_span_transforms();
        Ok(reader)
    }

    /// Applies the seq override and virtual bounds to the loaded spans.
    fn apply_span_transforms(&mut self) {
        let cmp = self.cmp;
        let stamp = self.seq_override;
        let restamp = |spans: &mut Vec<Span>| {
            if let Some(seq) = stamp {
                for span in spans.iter_mut() {
                    for key in span.keys.iter_mut() {
                        key.trailer = make_trailer(seq, trailer_kind_of(key.trailer));
                    }
                }
            }
        };
        restamp(&mut self.rangedels);
        restamp(&mut self.rangekeys);

        if let Some((lower, upper)) = &self.bounds {
            let lo = lower.user_key.clone();
            // A sentinel upper bound excludes its user key entirely, so
            // spans clamp to it; an inclusive upper needs no clamp because
            // physical spans never extend past the original bounds.
            let hi = if upper.trailer == make_trailer(SEQ_INF, KeyKind::RangeDelete) {
                Some(upper.user_key.clone())
            } else {
                None
            };
            let clamp = |spans: &mut Vec<Span>| {
                let kept: Vec<Span> = spans
                    .iter()
                    .filter_map(|s| s.truncate(cmp, Some(&lo), hi.as_deref()))
                    .collect();
                *spans = kept;
            };
            clamp(&mut self.rangedels);
            clamp(&mut self.rangekeys);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn props(&self) -> &TableProps {
        &self.props
    }

    /// Fragmented range tombstones, clamped and stamped.
    pub fn rangedel_spans(&self) -> Vec<Span> {
        self.rangedels.clone()
    }

    /// Fragmented range-key spans, clamped and stamped.
    pub fn rangekey_spans(&self) -> Vec<Span> {
        self.rangekeys.clone()
    }

    fn in_bounds(&self, key: &InternalKey) -> bool {
        match &self.bounds {
            None => true,
            Some((lower, upper)) => {
                key.cmp_with(self.cmp, lower) != CmpOrdering::Less
                    && key.cmp_with(self.cmp, upper) != CmpOrdering::Greater
            }
        }
    }

    /// Reads and decodes data block `i`, applying the bound filter and seq
    /// stamp.
    fn read_data_block(&self, i: usize) -> Result<Vec<(InternalKey, Vec<u8>)>> {
        let (_, offset, len) = &self.index[i];
        let mut data = vec![0u8; *len as usize];
        self.file.read_exact_at(&mut data, *offset)?;
        if data.len() < 4 {
            return errcorrupt!("sstable {} truncated data block", self.path.display());
        }
        let body_len = data.len() - 4;
        let stored = Cursor::new(&data[body_len..]).read_u32::<BigEndian>()?;
        if stored != CRC32.checksum(&data[..body_len]) {
            return errcorrupt!("sstable {} data block failed checksum", self.path.display());
        }
        let mut entries = decode_block(&data[..body_len])?;
        if let Some(seq) = self.seq_override {
            for (key, _) in entries.iter_mut() {
                key.trailer = make_trailer(seq, trailer_kind_of(key.trailer));
            }
        }
        entries.retain(|(key, _)| self.in_bounds(key));
        Ok(entries)
    }

    pub fn iter(self: &Arc<Self>) -> TableIter {
        TableIter {
            reader: Arc::clone(self),
            block: Vec::new(),
            block_idx: 0,
            entry_idx: 0,
            valid: false,
        }
    }
}

fn trailer_kind_of(trailer: u64) -> KeyKind {
    crate::key::trailer_kind(trailer).expect("stored trailer holds a valid kind")
}

/// Point iterator over a table's data blocks. Holds one decoded block at a
/// time.
pub struct TableIter {
    reader: Arc<TableReader>,
    block: Vec<(InternalKey, Vec<u8>)>,
    block_idx: usize,
    entry_idx: usize,
    valid: bool,
}

impl TableIter {
    fn load(&mut self, i: usize) -> Result<()> {
        self.block = self.reader.read_data_block(i)?;
        self.block_idx = i;
        Ok(())
    }

    /// Positions at the first entry of the first non-empty block at or
    /// after `i`.
    fn forward_from(&mut self, i: usize) -> Result<()> {
        let mut i = i;
        while i < self.reader.index.len() {
            self.load(i)?;
            if !self.block.is_empty() {
                self.entry_idx = 0;
                self.valid = true;
                return Ok(());
            }
            i += 1;
        }
        self.valid = false;
        Ok(())
    }

    /// Positions at the last entry of the last non-empty block at or
    /// before `i`.
    fn backward_from(&mut self, i: usize) -> Result<()> {
        let mut i = i as isize;
        while i >= 0 {
            self.load(i as usize)?;
            if !self.block.is_empty() {
                self.entry_idx = self.block.len() - 1;
                self.valid = true;
                return Ok(());
            }
            i -= 1;
        }
        self.valid = false;
        Ok(())
    }
}

impl InternalIterator for TableIter {
    fn first(&mut self) -> Result<()> {
        self.forward_from(0)
    }

    fn last(&mut self) -> Result<()> {
        if self.reader.index.is_empty() {
            self.valid = false;
            return Ok(());
        }
        self.backward_from(self.reader.index.len() - 1)
    }

    fn seek_ge(&mut self, user_key: &[u8]) -> Result<()> {
        if self.reader.index.is_empty() {
            self.valid = false;
            return Ok(());
        }
        let cmp = self.reader.cmp;
        let target = InternalKey::range_end_sentinel(user_key);
        // Last block whose first key is <= target could hold the answer.
        let idx = self
            .reader
            .index
            .partition_point(|(first, _, _)| first.cmp_with(cmp, &target) == CmpOrdering::Less);
        let start_block = idx.saturating_sub(1);
        self.load(start_block)?;
        let pos = self
            .block
            .partition_point(|(key, _)| key.cmp_with(cmp, &target) == CmpOrdering::Less);
        if pos < self.block.len() {
            self.entry_idx = pos;
            self.valid = true;
            Ok(())
        } else {
            self.forward_from(start_block + 1)
        }
    }

    fn seek_lt(&mut self, user_key: &[u8]) -> Result<()> {
        let cmp = self.reader.cmp;
        let target = InternalKey::range_end_sentinel(user_key);
        let idx = self
            .reader
            .index
            .partition_point(|(first, _, _)| first.cmp_with(cmp, &target) == CmpOrdering::Less);
        if idx == 0 {
            self.valid = false;
            return Ok(());
        }
        let start_block = idx - 1;
        self.load(start_block)?;
        let pos = self
            .block
            .partition_point(|(key, _)| key.cmp_with(cmp, &target) == CmpOrdering::Less);
        if pos > 0 {
            self.entry_idx = pos - 1;
            self.valid = true;
            Ok(())
        } else if start_block == 0 {
            self.valid = false;
            Ok(())
        } else {
            self.backward_from(start_block - 1)
        }
    }

    fn next(&mut self) -> Result<()> {
        assert!(self.valid, "next on invalid iterator");
        if self.entry_idx + 1 < self.block.len() {
            self.entry_idx += 1;
            Ok(())
        } else {
            self.forward_from(self.block_idx + 1)
        }
    }

    fn prev(&mut self) -> Result<()> {
        assert!(self.valid, "prev on invalid iterator");
        if self.entry_idx > 0 {
            self.entry_idx -= 1;
            Ok(())
        } else if self.block_idx == 0 {
            self.valid = false;
            Ok(())
        } else {
            self.backward_from(self.block_idx - 1)
        }
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &InternalKey {
        &self.block[self.entry_idx].0
    }

    fn value(&self) -> &[u8] {
        &self.block[self.entry_idx].1
    }
}
