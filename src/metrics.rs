//! Engine counters.
//!
//! A flat set of atomic counters bumped by the write path, flush,
//! compaction, ingestion, and the read path. `report` renders a
//! deterministic snapshot for the command driver; the scheduler
//! periodically dumps the same fields through `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub batches_committed: AtomicU64,
    pub records_committed: AtomicU64,
    pub wal_bytes: AtomicU64,
    pub memtable_rotations: AtomicU64,
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub read_compactions: AtomicU64,
    pub ingested_files: AtomicU64,
    pub excised_files: AtomicU64,
    pub gets: AtomicU64,
    pub iterators_opened: AtomicU64,
    pub obsolete_files_deleted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Deterministic text snapshot, one `name: value` per line.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (name, counter) in self.fields() {
            out.push_str(&format!("{name}: {}\n", counter.load(Ordering::Relaxed)));
        }
        out
    }

    /// Dumps every counter through tracing.
    pub fn log(&self) {
        tracing::info!(
            batches_committed = self.batches_committed.load(Ordering::Relaxed),
            records_committed = self.records_committed.load(Ordering::Relaxed),
            wal_bytes = self.wal_bytes.load(Ordering::Relaxed),
            memtable_rotations = self.memtable_rotations.load(Ordering::Relaxed),
            flushes = self.flushes.load(Ordering::Relaxed),
            compactions = self.compactions.load(Ordering::Relaxed),
            read_compactions = self.read_compactions.load(Ordering::Relaxed),
            ingested_files = self.ingested_files.load(Ordering::Relaxed),
            gets = self.gets.load(Ordering::Relaxed),
            "engine metrics"
        );
    }

    fn fields(&self) -> [(&'static str, &AtomicU64); 12] {
        [
            ("batches-committed", &self.batches_committed),
            ("records-committed", &self.records_committed),
            ("wal-bytes", &self.wal_bytes),
            ("memtable-rotations", &self.memtable_rotations),
            ("flushes", &self.flushes),
            ("compactions", &self.compactions),
            ("read-compactions", &self.read_compactions),
            ("ingested-files", &self.ingested_files),
            ("excised-files", &self.excised_files),
            ("gets", &self.gets),
            ("iterators-opened", &self.iterators_opened),
            ("obsolete-files-deleted", &self.obsolete_files_deleted),
        ]
    }
}
