//! # cinder
//!
//! An embedded, ordered key/value storage engine built on a
//! log-structured merge-tree.
//!
//! Writes land in a WAL-backed memtable, rotate into frozen memtables,
//! and flush to L0 sstables; compactions move data down through the
//! leveled tree. Reads merge every layer (mutable memtable, frozen
//! memtables, L0, deeper levels) through one iterator stack that also
//! carries range tombstones and suffix-qualified range keys, honoring
//! snapshots, bounds, and range-key masking. The file set evolves through
//! an append-only manifest with atomically switched markers, so a crash
//! at any point recovers to the last durable edit plus the WAL tail.
//!
//! ```no_run
//! use cinder::{Db, DbConfig};
//!
//! let db = Db::open(DbConfig::new("./data"))?;
//! db.set(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//! # cinder::Result::Ok(())
//! ```

pub mod batch;
pub mod checkpoint;
pub mod comparator;
pub mod compaction;
pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod flock;
pub mod ingest;
pub mod iterator;
pub mod key;
pub mod keyspan;
pub mod memtable;
pub mod metrics;
pub mod snapshot;
pub mod sstable;
pub mod version;
pub mod wal;

#[cfg(test)]
pub mod tmpfs;

// Public re-exports for the top-level API
pub use batch::Batch;
pub use comparator::{Comparator, BYTEWISE, VERSIONED};
pub use config::{CompactionConfig, DbConfig, SchedulerConfig};
pub use db::{Db, Snapshot};
pub use driver::Driver;
pub use error::{Error, Result};
pub use iterator::combined::{DbIterator, IterOptions};
pub use key::KeyKind;
