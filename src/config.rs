use std::path::PathBuf;
use std::time::Duration;

use crate::comparator::{Comparator, BYTEWISE};

/// Merge operator applied to `merge` operands, oldest to newest. `existing`
/// is the accumulated value below the operand (None when merging against
/// nothing).
pub type MergeFn = fn(user_key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8>;

/// The default merge operator concatenates operands oldest-first.
pub fn concat_merge(_user_key: &[u8], existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
    let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
    out.extend_from_slice(operand);
    out
}

/// Configuration for the database.
#[derive(Clone)]
pub struct DbConfig {
    /// Directory path for the database.
    pub dir: PathBuf,

    /// Maximum size for a memtable before rotation (default: 4MB).
    pub memtable_size: usize,

    /// Total order on user keys (default: bytewise).
    pub comparator: &'static Comparator,

    /// Merge operator for `merge` records (default: concatenation).
    pub merge: MergeFn,

    /// Sync the WAL on every commit (default: true).
    pub wal_sync: bool,

    /// Finalized WAL segments at most this large are queued for reuse
    /// (default: equal to `memtable_size`).
    pub wal_recycle_size: usize,

    /// Number of finalized WAL segments kept for reuse (default: 4).
    pub wal_recycle_limit: usize,

    /// Compaction tuning.
    pub compaction: CompactionConfig,

    /// Background task scheduling.
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// L0 file count that makes its score 1.0 (default: 4).
    pub l0_compaction_threshold: usize,

    /// Target size of L1; deeper levels grow geometrically (default: 8MB).
    pub level_base_size: u64,

    /// Multiplier between consecutive level targets (default: 10).
    pub level_size_multiplier: u64,

    /// Target size of a single output sstable (default: 2MB).
    pub target_file_size: u64,

    /// Number of concurrent background compactions (default: 2).
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to check for flush opportunities (default: 1s).
    pub flush_interval: Duration,

    /// How often to check for compaction opportunities (default: 5s).
    pub compaction_interval: Duration,

    /// How often to dump metrics to the log (default: 30s).
    pub metrics_interval: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        let memtable_size = 4 * 1024 * 1024;
        Self {
            dir: PathBuf::from("./cinder"),
            memtable_size,
            comparator: &BYTEWISE,
            merge: concat_merge,
            wal_sync: true,
            wal_recycle_size: memtable_size,
            wal_recycle_limit: 4,
            compaction: CompactionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_compaction_threshold: 4,
            level_base_size: 8 * 1024 * 1024,
            level_size_multiplier: 10,
            target_file_size: 2 * 1024 * 1024,
            max_concurrent: 2,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum memtable size.
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Set the user-key comparator.
    pub fn comparator(mut self, cmp: &'static Comparator) -> Self {
        self.comparator = cmp;
        self
    }

    /// Set the merge operator.
    pub fn merge(mut self, merge: MergeFn) -> Self {
        self.merge = merge;
        self
    }

    /// Enable or disable WAL fsync on commit.
    pub fn wal_sync(mut self, sync: bool) -> Self {
        self.wal_sync = sync;
        self
    }

    /// Configure compaction settings.
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }

    /// Configure scheduler settings.
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

impl CompactionConfig {
    /// Set the L0 compaction threshold.
    pub fn l0_compaction_threshold(mut self, threshold: usize) -> Self {
        self.l0_compaction_threshold = threshold;
        self
    }

    /// Set the L1 target size.
    pub fn level_base_size(mut self, size: u64) -> Self {
        self.level_base_size = size;
        self
    }

    /// Set the per-level size multiplier.
    pub fn level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.level_size_multiplier = multiplier;
        self
    }

    /// Set the target output sstable size.
    pub fn target_file_size(mut self, size: u64) -> Self {
        self.target_file_size = size;
        self
    }
}

impl SchedulerConfig {
    /// Set flush check interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set compaction check interval.
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set metrics dump interval.
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }
}
