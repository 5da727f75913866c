//! Data blocks.
//!
//! Entries are prefix-compressed against the previous key with restart
//! points every [`RESTART_INTERVAL`] entries:
//!
//! ```text
//! +------------+--------------+-------------+------------+-------+
//! |shared:u16  | unshared:u16 |value_len:u32| key suffix | value |
//! +------------+--------------+-------------+------------+-------+
//! ```
//!
//! followed by the restart offset array and its length. The stored key is
//! the user key with the 8-byte trailer appended.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::errcorrupt;
use crate::error::Result;
use crate::key::{trailer_kind, InternalKey};

const RESTART_INTERVAL: usize = 16;

/// Target size for a finished block; the last entry may push past it.
pub const BLOCK_SIZE: usize = 4096;

fn encode_key(key: &InternalKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.user_key.len() + 8);
    out.extend_from_slice(&key.user_key);
    out.write_u64::<BigEndian>(key.trailer).unwrap();
    out
}

fn decode_key(bytes: &[u8]) -> Result<InternalKey> {
    if bytes.len() < 8 {
        return errcorrupt!("block key shorter than its trailer");
    }
    let split = bytes.len() - 8;
    let trailer = Cursor::new(&bytes[split..]).read_u64::<BigEndian>()?;
    trailer_kind(trailer)?;
    Ok(InternalKey {
        user_key: bytes[..split].to_vec(),
        trailer,
    })
}

pub struct BlockBuilder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &InternalKey, value: &[u8]) {
        let key_bytes = encode_key(key);
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, &key_bytes)
        };

        self.buffer
            .write_u16::<BigEndian>(shared as u16)
            .unwrap();
        self.buffer
            .write_u16::<BigEndian>((key_bytes.len() - shared) as u16)
            .unwrap();
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .unwrap();
        self.buffer.extend_from_slice(&key_bytes[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key = key_bytes;
        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).unwrap();
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .unwrap();
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|&(a, b)| a == b).count()
}

/// Decodes a finished block into its entries.
pub fn decode_block(data: &[u8]) -> Result<Vec<(InternalKey, Vec<u8>)>> {
    if data.len() < 4 {
        return errcorrupt!("block shorter than its restart count");
    }
    let num_restarts =
        Cursor::new(&data[data.len() - 4..]).read_u32::<BigEndian>()? as usize;
    let restart_size = num_restarts
        .checked_mul(4)
        .and_then(|n| n.checked_add(4))
        .filter(|n| *n <= data.len())
        .ok_or_else(|| crate::Error::Corruption("block restart array overruns block".into()))?;
    let entries_end = data.len() - restart_size;

    let mut entries = Vec::new();
    let mut last_key: Vec<u8> = Vec::new();
    let mut cursor = Cursor::new(&data[..entries_end]);
    while (cursor.position() as usize) < entries_end {
        let shared = cursor.read_u16::<BigEndian>()? as usize;
        let unshared = cursor.read_u16::<BigEndian>()? as usize;
        let value_len = cursor.read_u32::<BigEndian>()? as usize;
        if shared > last_key.len() {
            return errcorrupt!("block entry shares more bytes than the previous key has");
        }
        let mut key_bytes = last_key[..shared].to_vec();
        let pos = cursor.position() as usize;
        if pos + unshared + value_len > entries_end {
            return errcorrupt!("block entry overruns block");
        }
        key_bytes.extend_from_slice(&data[pos..pos + unshared]);
        let value = data[pos + unshared..pos + unshared + value_len].to_vec();
        cursor.set_position((pos + unshared + value_len) as u64);

        entries.push((decode_key(&key_bytes)?, value));
        last_key = key_bytes;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyKind;

    fn key(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user_key, seq, KeyKind::Set)
    }

    #[test]
    fn build_decode_roundtrip() {
        let mut b = BlockBuilder::new();
        let keys = [
            key(b"apple", 9),
            key(b"apple", 3),
            key(b"apricot", 7),
            key(b"banana", 1),
        ];
        for (i, k) in keys.iter().enumerate() {
            b.add(k, format!("v{i}").as_bytes());
        }
        assert_eq!(b.entry_count(), 4);

        let entries = decode_block(&b.finish()).unwrap();
        assert_eq!(entries.len(), 4);
        for (i, (k, v)) in entries.iter().enumerate() {
            assert_eq!(k, &keys[i]);
            assert_eq!(v, format!("v{i}").as_bytes());
        }
    }

    #[test]
    fn restart_points_reset_compression() {
        let mut b = BlockBuilder::new();
        for i in 0..40u64 {
            b.add(&key(format!("key{i:04}").as_bytes(), i), b"v");
        }
        let entries = decode_block(&b.finish()).unwrap();
        assert_eq!(entries.len(), 40);
        assert_eq!(entries[17].0.user_key, b"key0017");
        assert_eq!(entries[39].0.user_key, b"key0039");
    }

    #[test]
    fn decode_rejects_truncated_block() {
        let mut b = BlockBuilder::new();
        b.add(&key(b"k", 1), b"value");
        let data = b.finish();
        assert!(decode_block(&data[..data.len() - 2]).is_err());
    }

    #[test]
    fn empty_block_decodes_empty() {
        let b = BlockBuilder::new();
        let entries = decode_block(&b.finish()).unwrap();
        assert!(entries.is_empty());
    }
}
