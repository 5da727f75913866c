//! Version edits.
//!
//! A tagged record stream describing one atomic transition of the file
//! set: counters, added files, removed files. An edit is accepted only if
//! applying it yields a version satisfying the level invariants.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{FileMetadata, Version, VirtualBounds, NUM_LEVELS};
use crate::comparator::Comparator;
use crate::errcorrupt;
use crate::error::Result;
use crate::key::{read_varstr, write_varstr, InternalKey};

const TAG_COMPARATOR: u8 = 0x01;
const TAG_NEXT_FILE_NUM: u8 = 0x02;
const TAG_LAST_SEQ: u8 = 0x03;
const TAG_LOG_NUM: u8 = 0x04;
const TAG_MIN_UNFLUSHED_LOG_NUM: u8 = 0x05;
const TAG_ADDED: u8 = 0x06;
const TAG_REMOVED: u8 = 0x07;

/// One manifest record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub next_file_num: Option<u64>,
    pub last_seq: Option<u64>,
    /// Log in use when the edit was written.
    pub log_num: Option<u64>,
    /// Logs strictly below this are fully flushed.
    pub min_unflushed_log_num: Option<u64>,
    pub added: Vec<(u32, FileMetadata)>,
    pub removed: Vec<(u32, u64)>,
}

fn write_opt_key(buf: &mut Vec<u8>, key: &Option<InternalKey>) -> Result<()> {
    match key {
        Some(k) => {
            buf.push(1);
            k.encode_into(buf)?;
        }
        None => buf.push(0),
    }
    Ok(())
}

fn read_opt_key(cursor: &mut Cursor<&[u8]>) -> Result<Option<InternalKey>> {
    Ok(match cursor.read_u8()? {
        0 => None,
        _ => Some(InternalKey::decode_from(cursor)?),
    })
}

impl FileMetadata {
    fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u64::<BigEndian>(self.num)?;
        buf.write_u64::<BigEndian>(self.size)?;
        self.smallest.encode_into(buf)?;
        self.largest.encode_into(buf)?;
        write_opt_key(buf, &self.smallest_point)?;
        write_opt_key(buf, &self.largest_point)?;
        write_opt_key(buf, &self.smallest_range)?;
        write_opt_key(buf, &self.largest_range)?;
        buf.write_u64::<BigEndian>(self.smallest_seq)?;
        buf.write_u64::<BigEndian>(self.largest_seq)?;
        buf.write_u32::<BigEndian>(self.creation_level)?;
        match &self.virtual_bounds {
            Some(v) => {
                buf.push(1);
                buf.write_u64::<BigEndian>(v.backing_num)?;
                v.lower.encode_into(buf)?;
                v.upper.encode_into(buf)?;
            }
            None => buf.push(0),
        }
        match self.seq_override {
            Some(seq) => {
                buf.push(1);
                buf.write_u64::<BigEndian>(seq)?;
            }
            None => buf.push(0),
        }
        Ok(())
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let num = cursor.read_u64::<BigEndian>()?;
        let size = cursor.read_u64::<BigEndian>()?;
        let smallest = InternalKey::decode_from(cursor)?;
        let largest = InternalKey::decode_from(cursor)?;
        let smallest_point = read_opt_key(cursor)?;
        let largest_point = read_opt_key(cursor)?;
        let smallest_range = read_opt_key(cursor)?;
        let largest_range = read_opt_key(cursor)?;
        let smallest_seq = cursor.read_u64::<BigEndian>()?;
        let largest_seq = cursor.read_u64::<BigEndian>()?;
        let creation_level = cursor.read_u32::<BigEndian>()?;
        let virtual_bounds = match cursor.read_u8()? {
            0 => None,
            _ => Some(VirtualBounds {
                backing_num: cursor.read_u64::<BigEndian>()?,
                lower: InternalKey::decode_from(cursor)?,
                upper: InternalKey::decode_from(cursor)?,
            }),
        };
        let seq_override = match cursor.read_u8()? {
            0 => None,
            _ => Some(cursor.read_u64::<BigEndian>()?),
        };
        Ok(Self {
            num,
            size,
            smallest,
            largest,
            smallest_point,
            largest_point,
            smallest_range,
            largest_range,
            smallest_seq,
            largest_seq,
            creation_level,
            virtual_bounds,
            seq_override,
        })
    }
}

impl VersionEdit {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator_name {
            buf.push(TAG_COMPARATOR);
            write_varstr(&mut buf, name.as_bytes()).unwrap();
        }
        if let Some(n) = self.next_file_num {
            buf.push(TAG_NEXT_FILE_NUM);
            buf.write_u64::<BigEndian>(n).unwrap();
        }
        if let Some(n) = self.last_seq {
            buf.push(TAG_LAST_SEQ);
            buf.write_u64::<BigEndian>(n).unwrap();
        }
        if let Some(n) = self.log_num {
            buf.push(TAG_LOG_NUM);
            buf.write_u64::<BigEndian>(n).unwrap();
        }
        if let Some(n) = self.min_unflushed_log_num {
            buf.push(TAG_MIN_UNFLUSHED_LOG_NUM);
            buf.write_u64::<BigEndian>(n).unwrap();
        }
        for (level, meta) in &self.added {
            buf.push(TAG_ADDED);
            buf.write_u32::<BigEndian>(*level).unwrap();
            meta.encode_into(&mut buf).unwrap();
        }
        for (level, num) in &self.removed {
            buf.push(TAG_REMOVED);
            buf.write_u32::<BigEndian>(*level).unwrap();
            buf.write_u64::<BigEndian>(*num).unwrap();
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut edit = VersionEdit::default();
        let mut cursor = Cursor::new(data);
        while (cursor.position() as usize) < data.len() {
            match cursor.read_u8()? {
                TAG_COMPARATOR => {
                    let name = read_varstr(&mut cursor)?;
                    edit.comparator_name = Some(
                        String::from_utf8(name)
                            .map_err(|_| crate::Error::Corruption("comparator name not utf-8".into()))?,
                    );
                }
                TAG_NEXT_FILE_NUM => edit.next_file_num = Some(cursor.read_u64::<BigEndian>()?),
                TAG_LAST_SEQ => edit.last_seq = Some(cursor.read_u64::<BigEndian>()?),
                TAG_LOG_NUM => edit.log_num = Some(cursor.read_u64::<BigEndian>()?),
                TAG_MIN_UNFLUSHED_LOG_NUM => {
                    edit.min_unflushed_log_num = Some(cursor.read_u64::<BigEndian>()?)
                }
                TAG_ADDED => {
                    let level = cursor.read_u32::<BigEndian>()?;
                    let meta = FileMetadata::decode_from(&mut cursor)?;
                    edit.added.push((level, meta));
                }
                TAG_REMOVED => {
                    let level = cursor.read_u32::<BigEndian>()?;
                    let num = cursor.read_u64::<BigEndian>()?;
                    edit.removed.push((level, num));
                }
                tag => return errcorrupt!("unknown version edit tag {tag}"),
            }
        }
        Ok(edit)
    }
}

impl Version {
    /// Applies `edit`, yielding the successor version. Fails with
    /// `Corruption` when the edit removes a file the version does not hold
    /// or the result violates the level invariants.
    pub fn apply(&self, cmp: &Comparator, edit: &VersionEdit) -> Result<Version> {
        let mut next = self.clone();
        for (level, num) in &edit.removed {
            let level = *level as usize;
            if level >= NUM_LEVELS {
                return errcorrupt!("edit removes from level {level}");
            }
            let before = next.levels[level].len();
            next.levels[level].retain(|f| f.num != *num);
            if next.levels[level].len() == before {
                return errcorrupt!("edit removes file {num:06} absent from level {level}");
            }
        }
        for (level, meta) in &edit.added {
            let level = *level as usize;
            if level >= NUM_LEVELS {
                return errcorrupt!("edit adds to level {level}");
            }
            next.levels[level].push(Arc::new(meta.clone()));
        }
        next.sort(cmp);
        next.validate(cmp)?;
        Ok(next)
    }
}
