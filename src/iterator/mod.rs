//! The iterator stack.
//!
//! Point iterators implement [`InternalIterator`], a synchronous cursor
//! over internal keys. The closed set of implementations: memtable, indexed
//! batch, sstable, level, and the N-way merging iterator. The user-facing
//! [`combined::DbIterator`] interleaves the merged point stream with
//! fragmented range-key spans.

pub mod combined;
pub mod level;
pub mod merging;

use crate::error::Result;
use crate::key::InternalKey;

/// A positioned cursor over internal keys in `(user key asc, trailer desc)`
/// order.
///
/// Absolute positioning (`first`, `last`, `seek_ge`, `seek_lt`) may land on
/// an invalid position; `next`/`prev` require a valid position. `key` and
/// `value` are meaningful only while `valid` holds. Seeks take user keys:
/// `seek_ge` positions at the first record whose user key is `>=` the
/// target (all its versions included), `seek_lt` at the last record whose
/// user key is `<` the target.
pub trait InternalIterator: Send {
    fn first(&mut self) -> Result<()>;
    fn last(&mut self) -> Result<()>;
    fn seek_ge(&mut self, user_key: &[u8]) -> Result<()>;
    fn seek_lt(&mut self, user_key: &[u8]) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    fn prev(&mut self) -> Result<()>;
    fn valid(&self) -> bool;
    fn key(&self) -> &InternalKey;
    fn value(&self) -> &[u8];
}

pub type BoxedIterator<'a> = Box<dyn InternalIterator + 'a>;
