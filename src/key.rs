//! Internal keys.
//!
//! Every record in the engine is keyed by `(user_key, seq, kind)`. The
//! 56-bit sequence number and 8-bit kind pack into a `u64` trailer; keys
//! order by user key ascending, then trailer descending, so the newest
//! record for a user key is encountered first.

use std::cmp::Ordering;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::comparator::Comparator;
use crate::errcorrupt;
use crate::error::Result;

/// Maximum representable sequence number. Doubles as the `inf` sentinel on
/// the exclusive end boundary of a range fragment.
pub const SEQ_INF: u64 = (1 << 56) - 1;

/// Sequence base for uncommitted indexed-batch entries: far above any
/// committed sequence number, so batch state orders newest and stays
/// visible at every read ceiling.
pub const BATCH_SEQ_BASE: u64 = 1 << 55;

/// Whether an entry at `seq` is visible to a reader with the given
/// committed ceiling. Indexed-batch entries are always visible to the
/// iterator that carries them.
#[inline]
pub fn is_visible(seq: u64, ceiling: u64) -> bool {
    seq <= ceiling || seq >= BATCH_SEQ_BASE
}

/// Record kinds. The numeric value participates in trailer ordering: for
/// equal sequence numbers the higher kind orders first, which places range
/// tombstone sentinels ahead of point keys at the same user key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum KeyKind {
    Delete = 0,
    Set = 1,
    Merge = 2,
    LogData = 3,
    SingleDelete = 7,
    RangeDelete = 15,
    SetWithDelete = 18,
    RangeKeyDelete = 19,
    RangeKeyUnset = 20,
    RangeKeySet = 21,
    IngestSst = 22,
    DeleteSized = 23,
}

impl KeyKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => KeyKind::Delete,
            1 => KeyKind::Set,
            2 => KeyKind::Merge,
            3 => KeyKind::LogData,
            7 => KeyKind::SingleDelete,
            15 => KeyKind::RangeDelete,
            18 => KeyKind::SetWithDelete,
            19 => KeyKind::RangeKeyDelete,
            20 => KeyKind::RangeKeyUnset,
            21 => KeyKind::RangeKeySet,
            22 => KeyKind::IngestSst,
            23 => KeyKind::DeleteSized,
            _ => return errcorrupt!("unknown key kind {v}"),
        })
    }

    /// Whether records of this kind carry a value payload in a batch.
    pub fn has_value(self) -> bool {
        !matches!(self, KeyKind::Delete | KeyKind::SingleDelete)
    }

    /// Point tombstones: kinds that hide older point records outright.
    pub fn is_point_tombstone(self) -> bool {
        matches!(
            self,
            KeyKind::Delete | KeyKind::SingleDelete | KeyKind::DeleteSized
        )
    }

    /// Range-key kinds share a fragment space separate from range deletes.
    pub fn is_range_key(self) -> bool {
        matches!(
            self,
            KeyKind::RangeKeySet | KeyKind::RangeKeyUnset | KeyKind::RangeKeyDelete
        )
    }
}

/// Packs `(seq, kind)` into the trailer representation.
#[inline]
pub fn make_trailer(seq: u64, kind: KeyKind) -> u64 {
    debug_assert!(seq <= SEQ_INF);
    (seq << 8) | kind as u64
}

#[inline]
pub fn trailer_seq(trailer: u64) -> u64 {
    trailer >> 8
}

#[inline]
pub fn trailer_kind(trailer: u64) -> Result<KeyKind> {
    KeyKind::from_u8((trailer & 0xff) as u8)
}

/// An internal key: user key plus `(seq << 8 | kind)` trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub user_key: Vec<u8>,
    pub trailer: u64,
}

impl InternalKey {
    pub fn new(user_key: impl Into<Vec<u8>>, seq: u64, kind: KeyKind) -> Self {
        Self {
            user_key: user_key.into(),
            trailer: make_trailer(seq, kind),
        }
    }

    /// The largest possible key for `user_key`: orders before every real
    /// record of that user key. Used as the exclusive-end sentinel of range
    /// fragments and as a seek target.
    pub fn range_end_sentinel(user_key: impl Into<Vec<u8>>) -> Self {
        Self::new(user_key, SEQ_INF, KeyKind::RangeDelete)
    }

    pub fn seq(&self) -> u64 {
        trailer_seq(self.trailer)
    }

    pub fn kind(&self) -> KeyKind {
        trailer_kind(self.trailer).expect("trailer holds a valid kind")
    }

    /// Total order: user key ascending, trailer descending.
    pub fn cmp_with(&self, cmp: &Comparator, other: &Self) -> Ordering {
        cmp.cmp(&self.user_key, &other.user_key)
            .then_with(|| other.trailer.cmp(&self.trailer))
    }

    pub fn encode_into<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<BigEndian>(self.user_key.len() as u32)?;
        w.write_all(&self.user_key)?;
        w.write_u64::<BigEndian>(self.trailer)?;
        Ok(())
    }

    pub fn decode_from<R: Read>(r: &mut R) -> Result<Self> {
        let len = r.read_u32::<BigEndian>()? as usize;
        let mut user_key = vec![0u8; len];
        r.read_exact(&mut user_key)?;
        let trailer = r.read_u64::<BigEndian>()?;
        trailer_kind(trailer)?;
        Ok(Self { user_key, trailer })
    }
}

impl std::fmt::Display for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{},{:?}",
            String::from_utf8_lossy(&self.user_key),
            self.seq(),
            trailer_kind(self.trailer).map_err(|_| std::fmt::Error)?
        )
    }
}

/// Appends a length-prefixed byte string, the batch and block "varstr".
pub fn write_varstr<W: Write>(w: &mut W, s: &[u8]) -> Result<()> {
    w.write_u32::<BigEndian>(s.len() as u32)?;
    w.write_all(s)?;
    Ok(())
}

pub fn read_varstr<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}
