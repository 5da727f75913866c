//! The database facade.
//!
//! Owns the commit pipeline, the memtable lifecycle, the manifest writer,
//! snapshot and read-compaction bookkeeping, and background scheduling.
//! Writers serialize on the commit mutex for sequence assignment and WAL
//! append; readers clone the read state under a short lock and never block
//! writers. The version pointer swaps under the manifest writer lock, and
//! obsolete physical files are deleted only once no live version
//! references them.
//!
//! Lock order, outermost first: the flush mutex (held by ingestion across
//! its flush-to-install window), then commit, then the version state.
//! Compaction and ingestion additionally serialize on the major-ops mutex;
//! nothing that holds the commit or version lock ever waits on the flush
//! mutex.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::checkpoint::{write_checkpoint, CheckpointEnv};
use crate::comparator::Comparator;
use crate::compaction::{run_compaction, CompactionInput, CompactionParams};
use crate::config::DbConfig;
use crate::errcorrupt;
use crate::errinput;
use crate::error::Result;
use crate::flock::FileLock;
use crate::ingest;
use crate::iterator::combined::{DbIterator, IterConfig, IterOptions};
use crate::iterator::level::LevelIter;
use crate::iterator::merging::MergingIter;
use crate::iterator::BoxedIterator;
use crate::keyspan::{fragment_all, Span};
use crate::memtable::Memtable;
use crate::metrics::Metrics;
use crate::snapshot::SnapshotList;
use crate::sstable::sst_path;
use crate::version::manifest::{self, move_marker, Manifest, FORMAT_MARKER, MANIFEST_MARKER};
use crate::version::picker::{
    pick_compaction, pick_manual, CompactionPick, CompactionReason, ReadCompaction,
    ReadCompactionQueue,
};
use crate::version::{edit::VersionEdit, LiveVersions, Version, NUM_LEVELS};
use crate::wal::recycler::{FileInfo, LogRecycler};
use crate::wal::{self, log_path, Wal};
use crate::Error;

mod background;
use background::Maintenance;

const LOCK_FILE: &str = "LOCK";

/// Engine-level format major version, persisted via the format marker and
/// ratcheted explicitly.
pub const FORMAT_VERSION: u32 = 1;

/// Subset of the configuration persisted as `OPTIONS-<N>`.
#[derive(Debug, Serialize, Deserialize)]
struct OptionsSnapshot {
    comparator: String,
    memtable_size: u64,
    wal_sync: bool,
    l0_compaction_threshold: u64,
    level_base_size: u64,
    level_size_multiplier: u64,
    target_file_size: u64,
}

struct CommitState {
    wal: Wal,
}

struct ReadState {
    active: Arc<Memtable>,
    /// Frozen memtables, oldest first.
    immutables: Vec<Arc<Memtable>>,
    version: Arc<Version>,
}

struct VersionState {
    manifest: Manifest,
    current: Arc<Version>,
    log_num: u64,
    min_unflushed_log_num: u64,
    /// Physical file numbers awaiting deletion.
    obsolete: Vec<u64>,
}

pub struct DbInner {
    config: DbConfig,
    cmp: &'static Comparator,
    dir: PathBuf,
    _lock: FileLock,
    commit: Mutex<CommitState>,
    read_state: RwLock<ReadState>,
    versions: Mutex<VersionState>,
    live_versions: LiveVersions,
    snapshots: SnapshotList,
    read_compactions: ReadCompactionQueue,
    metrics: Metrics,
    next_file_num: AtomicU64,
    last_seq: AtomicU64,
    recycler: LogRecycler,
    read_only: AtomicBool,
    shutting_down: AtomicBool,
    flush_lock: Mutex<()>,
    major_ops: Mutex<()>,
    format_version: AtomicU64,
    options_file: PathBuf,
    maintenance: Mutex<Option<Maintenance>>,
}

/// An open database handle. Cheap to clone; the last clone dropping
/// releases the directory lock.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Opens (creating or recovering) the database at `config.dir`.
    pub fn open(config: DbConfig) -> Result<Db> {
        let cmp = config.comparator;
        let dir = config.dir.clone();
        std::fs::create_dir_all(&dir)?;
        let lock = FileLock::lock(dir.join(LOCK_FILE))?;

        let mut version = Version::new();
        let mut next_file_num = 1u64;
        let mut last_seq = 0u64;
        let mut min_unflushed_log_num = 0u64;

        // Replay the manifest named by the marker.
        let old_manifest = manifest::read_marker(&dir, MANIFEST_MARKER)?;
        if let Some((_, target)) = &old_manifest {
            for edit in manifest::replay(&dir.join(target))? {
                if let Some(name) = &edit.comparator_name {
                    if name != cmp.name {
                        return errcorrupt!(
                            "database created with comparator {name}, opened with {}",
                            cmp.name
                        );
                    }
                }
                version = version.apply(cmp, &edit)?;
                if let Some(n) = edit.next_file_num {
                    next_file_num = next_file_num.max(n);
                }
                if let Some(n) = edit.last_seq {
                    last_seq = last_seq.max(n);
                }
                if let Some(n) = edit.min_unflushed_log_num {
                    min_unflushed_log_num = min_unflushed_log_num.max(n);
                }
            }
        }

        // Replay WAL segments at or past the flushed frontier into frozen
        // memtables.
        let mut log_nums: Vec<u64> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(num) = stem.parse::<u64>() {
                    if num >= min_unflushed_log_num {
                        log_nums.push(num);
                    } else {
                        // Fully flushed in a previous life.
                        let _ = std::fs::remove_file(log_path(&dir, num));
                    }
                }
            }
        }
        log_nums.sort_unstable();
        let mut immutables: Vec<Arc<Memtable>> = Vec::new();
        for num in &log_nums {
            let mem = Memtable::new(cmp, usize::MAX / 2, *num);
            for payload in wal::replay(&log_path(&dir, *num))? {
                let (seq, batch) = Batch::decode(&payload)?;
                mem.add(&batch, seq)?;
                if batch.count() > 0 {
                    last_seq = last_seq.max(seq + batch.count() as u64 - 1);
                }
            }
            if !mem.is_empty() {
                mem.mark_frozen()?;
                immutables.push(Arc::new(mem));
            }
        }

        // Fresh WAL and active memtable.
        let new_log_num = next_file_num;
        next_file_num += 1;
        let wal = Wal::create(log_path(&dir, new_log_num), new_log_num)?;
        let active = Arc::new(Memtable::new(cmp, config.memtable_size, new_log_num));
        let min_unflushed = immutables
            .iter()
            .map(|m| m.log_num())
            .min()
            .unwrap_or(new_log_num);

        // Roll to a fresh manifest holding one snapshot edit.
        let manifest_num = next_file_num;
        next_file_num += 1;
        let options_num = next_file_num;
        next_file_num += 1;

        let mut manifest_file = Manifest::create(&dir, manifest_num)?;
        let snapshot_edit = VersionEdit {
            comparator_name: Some(cmp.name.to_string()),
            next_file_num: Some(next_file_num),
            last_seq: Some(last_seq),
            log_num: Some(new_log_num),
            min_unflushed_log_num: Some(min_unflushed),
            added: version
                .levels
                .iter()
                .enumerate()
                .flat_map(|(level, files)| {
                    files.iter().map(move |f| (level as u32, (**f).clone()))
                })
                .collect(),
            removed: Vec::new(),
        };
        manifest_file.append(&snapshot_edit)?;
        move_marker(
            &dir,
            MANIFEST_MARKER,
            &format!("MANIFEST-{manifest_num:06}"),
        )?;
        if let Some((_, old_target)) = old_manifest {
            let _ = std::fs::remove_file(dir.join(old_target));
        }

        // Format version marker, initialized on first open.
        let format_version = match manifest::read_marker(&dir, FORMAT_MARKER)? {
            Some((_, fmv)) => fmv.parse::<u64>().map_err(|_| {
                Error::Corruption(format!("unparseable format version marker {fmv}"))
            })?,
            None => {
                move_marker(&dir, FORMAT_MARKER, &FORMAT_VERSION.to_string())?;
                FORMAT_VERSION as u64
            }
        };
        if format_version > FORMAT_VERSION as u64 {
            return Err(Error::TableFormatUnsupported(format_version as u32));
        }

        // Options snapshot.
        let options_file = dir.join(format!("OPTIONS-{options_num:06}"));
        let snapshot = OptionsSnapshot {
            comparator: cmp.name.to_string(),
            memtable_size: config.memtable_size as u64,
            wal_sync: config.wal_sync,
            l0_compaction_threshold: config.compaction.l0_compaction_threshold as u64,
            level_base_size: config.compaction.level_base_size,
            level_size_multiplier: config.compaction.level_size_multiplier,
            target_file_size: config.compaction.target_file_size,
        };
        std::fs::write(&options_file, bincode::serialize(&snapshot)?)?;
        manifest::sync_dir(&dir)?;

        let version = Arc::new(version);
        let live_versions = LiveVersions::new();
        live_versions.register(&version);

        let recycle_limit = config.wal_recycle_limit;
        let inner = Arc::new(DbInner {
            cmp,
            dir,
            _lock: lock,
            commit: Mutex::new(CommitState { wal }),
            read_state: RwLock::new(ReadState {
                active,
                immutables: immutables.clone(),
                version: Arc::clone(&version),
            }),
            versions: Mutex::new(VersionState {
                manifest: manifest_file,
                current: version,
                log_num: new_log_num,
                min_unflushed_log_num: min_unflushed,
                obsolete: Vec::new(),
            }),
            live_versions,
            snapshots: SnapshotList::new(),
            read_compactions: ReadCompactionQueue::new(),
            metrics: Metrics::new(),
            next_file_num: AtomicU64::new(next_file_num),
            last_seq: AtomicU64::new(last_seq),
            recycler: LogRecycler::new(recycle_limit, new_log_num),
            read_only: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            major_ops: Mutex::new(()),
            format_version: AtomicU64::new(format_version),
            options_file,
            maintenance: Mutex::new(None),
            config,
        });

        tracing::info!(
            dir = %inner.dir.display(),
            last_seq,
            recovered_memtables = immutables.len(),
            files = inner.versions.lock().unwrap().current.num_files(),
            "opened database"
        );
        let db = Db { inner };
        // Recovered memtables flush right away: their WAL segments retire
        // and a read-mostly caller does not pin them across restarts.
        if !immutables.is_empty() {
            db.flush_immutables()?;
        }
        Ok(db)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Highest committed sequence number.
    pub fn last_seq(&self) -> u64 {
        self.inner.last_seq.load(Ordering::Acquire)
    }

    pub fn format_version(&self) -> u32 {
        self.inner.format_version.load(Ordering::SeqCst) as u32
    }

    /// Ratchets the format major version. Never moves backward.
    pub fn ratchet_format_version(&self, version: u32) -> Result<()> {
        let current = self.format_version();
        if version < current {
            return errinput!("format version cannot move backward: {current} -> {version}");
        }
        if version > FORMAT_VERSION {
            return Err(Error::TableFormatUnsupported(version));
        }
        move_marker(&self.inner.dir, FORMAT_MARKER, &version.to_string())?;
        self.inner
            .format_version
            .store(version as u64, Ordering::SeqCst);
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.read_only.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    fn latch_read_only(&self, err: &Error) {
        if matches!(err, Error::Corruption(_) | Error::Io(_)) {
            tracing::error!(error = %err, "marking database read-only");
            self.inner.read_only.store(true, Ordering::SeqCst);
        }
    }

    // Write path -----------------------------------------------------------

    /// Commits a batch: assigns its sequence range, appends it to the WAL,
    /// publishes it to the active memtable. Memtable capacity is invisible
    /// to the caller; the pipeline rotates and retries.
    pub fn apply(&self, batch: &Batch, sync: bool) -> Result<()> {
        self.check_writable()?;
        if let Some(paths) = batch.as_ingest() {
            batch.mark_committed()?;
            let paths: Vec<PathBuf> = paths.into_iter().map(PathBuf::from).collect();
            return self.ingest(&paths);
        }
        batch.mark_committed()?;
        if batch.is_empty() {
            return Ok(());
        }

        let mut commit = self.inner.commit.lock()?;
        let base_seq = self.inner.last_seq.load(Ordering::Acquire) + 1;
        let payload = batch.encode(base_seq);

        // Rotate up front when the batch will not fit, so the WAL record
        // lands in the segment paired with the memtable it fills.
        {
            let active = self.inner.read_state.read()?.active.clone();
            if !active.is_empty()
                && active.approximate_size() + batch.memtable_size()
                    > self.inner.config.memtable_size
            {
                self.rotate_memtable(&mut commit)?;
            }
        }

        let result = (|| {
            commit.wal.append(&payload)?;
            if sync {
                commit.wal.sync()?;
            } else {
                commit.wal.flush()?;
            }
            let active = self.inner.read_state.read()?.active.clone();
            match active.add(batch, base_seq) {
                Ok(()) => Ok(()),
                Err(Error::MemtableFull) | Err(Error::ReadOnly) => {
                    self.rotate_memtable(&mut commit)?;
                    let active = self.inner.read_state.read()?.active.clone();
                    active.add(batch, base_seq)
                }
                Err(e) => Err(e),
            }
        })();
        if let Err(e) = &result {
            self.latch_read_only(e);
            return result;
        }

        if batch.count() > 0 {
            self.inner
                .last_seq
                .store(base_seq + batch.count() as u64 - 1, Ordering::Release);
        }
        Metrics::bump(&self.inner.metrics.batches_committed);
        Metrics::add(&self.inner.metrics.records_committed, batch.count() as u64);
        Metrics::add(&self.inner.metrics.wal_bytes, payload.len() as u64);
        Ok(())
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.set(key, value)?;
        self.apply(&batch, self.inner.config.wal_sync)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(key)?;
        self.apply(&batch, self.inner.config.wal_sync)
    }

    /// Rotates WAL and memtable. Caller holds the commit mutex.
    fn rotate_memtable(&self, commit: &mut CommitState) -> Result<()> {
        commit.wal.sync()?;

        let new_num = self.inner.next_file_num.fetch_add(1, Ordering::SeqCst);
        let path = log_path(&self.inner.dir, new_num);
        // Reuse a recycled segment when one is queued: renaming an
        // existing inode spares the directory-metadata fsync of creating
        // a file.
        if let Some(info) = self.inner.recycler.peek() {
            let old_path = log_path(&self.inner.dir, info.num);
            if std::fs::rename(&old_path, &path).is_ok() {
                let _ = self.inner.recycler.pop(info.num);
            }
        }
        let new_wal = Wal::create(&path, new_num)?;
        let old_wal = std::mem::replace(&mut commit.wal, new_wal);
        drop(old_wal);

        {
            let mut rs = self.inner.read_state.write()?;
            let new_mem = Arc::new(Memtable::new(
                self.inner.cmp,
                self.inner.config.memtable_size,
                new_num,
            ));
            let old = std::mem::replace(&mut rs.active, new_mem);
            old.mark_frozen()?;
            rs.immutables.push(old);
        }
        self.inner.versions.lock()?.log_num = new_num;
        Metrics::bump(&self.inner.metrics.memtable_rotations);
        tracing::debug!(log_num = new_num, "rotated memtable and wal");
        Ok(())
    }

    // Flush ----------------------------------------------------------------

    /// Rotates the active memtable (if non-empty) and flushes every frozen
    /// memtable to L0.
    pub fn flush(&self) -> Result<bool> {
        self.check_writable()?;
        {
            let mut commit = self.inner.commit.lock()?;
            let active_empty = self.inner.read_state.read()?.active.is_empty();
            if !active_empty {
                self.rotate_memtable(&mut commit)?;
            }
        }
        self.flush_immutables()
    }

    /// Flushes the frozen memtable queue to L0 sstables.
    pub fn flush_immutables(&self) -> Result<bool> {
        let _guard = self.inner.flush_lock.lock()?;
        let mems = self.inner.read_state.read()?.immutables.clone();
        if mems.is_empty() {
            return Ok(false);
        }

        let result = self.flush_mems(&mems);
        if let Err(e) = &result {
            self.latch_read_only(e);
        }
        result?;
        Ok(true)
    }

    fn flush_mems(&self, mems: &[Arc<Memtable>]) -> Result<()> {
        let cmp = self.inner.cmp;
        let iters: Vec<BoxedIterator<'static>> = mems
            .iter()
            .map(|m| Box::new(m.point_iter()) as BoxedIterator<'static>)
            .collect();
        let input = CompactionInput {
            point: MergingIter::new(cmp, iters),
            rangedels: fragment_all(
                cmp,
                mems.iter().flat_map(|m| m.rangedel_iter()).collect(),
            ),
            rangekeys: fragment_all(
                cmp,
                mems.iter().flat_map(|m| m.rangekey_iter()).collect(),
            ),
        };
        let params = CompactionParams {
            cmp,
            merge: self.inner.config.merge,
            dir: &self.inner.dir,
            snapshots: self.inner.snapshots.seqs(),
            bottommost: false,
            target_file_size: self.inner.config.compaction.target_file_size,
            output_level: 0,
            file_nums: &self.inner.next_file_num,
            shutting_down: Some(&self.inner.shutting_down),
        };
        let metas = run_compaction(&params, input)?;

        let flushed_max = mems.iter().map(|m| m.log_num()).max().expect("non-empty");
        let min_unflushed = flushed_max + 1;
        let new_version = {
            let mut vs = self.inner.versions.lock()?;
            let edit = VersionEdit {
                next_file_num: Some(self.inner.next_file_num.load(Ordering::SeqCst)),
                last_seq: Some(self.inner.last_seq.load(Ordering::Acquire)),
                log_num: Some(vs.log_num),
                min_unflushed_log_num: Some(min_unflushed),
                added: metas.iter().map(|m| (0, m.clone())).collect(),
                removed: Vec::new(),
                ..VersionEdit::default()
            };
            vs.manifest.append(&edit)?;
            let next = Arc::new(vs.current.apply(self.inner.cmp, &edit)?);
            self.inner.live_versions.register(&next);
            vs.current = Arc::clone(&next);
            vs.min_unflushed_log_num = min_unflushed;
            next
        };
        {
            let mut rs = self.inner.read_state.write()?;
            rs.version = new_version;
            rs.immutables
                .retain(|m| !mems.iter().any(|f| Arc::ptr_eq(f, m)));
        }

        // Finalized segments go to the recycler or the bin.
        for mem in mems {
            let path = log_path(&self.inner.dir, mem.log_num());
            let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let keep = size <= self.inner.config.wal_recycle_size as u64
                && self.inner.recycler.add(FileInfo {
                    num: mem.log_num(),
                    size,
                });
            if !keep {
                let _ = std::fs::remove_file(&path);
            }
        }

        Metrics::bump(&self.inner.metrics.flushes);
        tracing::info!(
            memtables = mems.len(),
            outputs = metas.len(),
            "flushed memtables to L0"
        );
        Ok(())
    }

    // Compaction -----------------------------------------------------------

    /// Runs one compaction if the picker (read-triggered queue first) finds
    /// work. Returns whether a compaction ran.
    pub fn maybe_compact(&self) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.inner.major_ops.lock()?;
        let version = self.inner.read_state.read()?.version.clone();
        let pick = self
            .inner
            .read_compactions
            .pop_valid(self.inner.cmp, &version)
            .or_else(|| {
                pick_compaction(self.inner.cmp, &version, &self.inner.config.compaction)
            });
        match pick {
            None => Ok(false),
            Some(pick) => {
                let result = self.run_pick(pick);
                if let Err(e) = &result {
                    self.latch_read_only(e);
                }
                result.map(|_| true)
            }
        }
    }

    /// Compacts every populated level downward once, shallowest first.
    /// The driver's `compact` command and tests use this to reach a fully
    /// settled shape.
    pub fn compact_all(&self) -> Result<()> {
        self.check_writable()?;
        let _guard = self.inner.major_ops.lock()?;
        for level in 0..NUM_LEVELS - 1 {
            let version = self.inner.read_state.read()?.version.clone();
            if let Some(pick) = pick_manual(self.inner.cmp, &version, level) {
                let result = self.run_pick(pick);
                if let Err(e) = &result {
                    self.latch_read_only(e);
                }
                result?;
            }
        }
        Ok(())
    }

    /// Marks a file for read-triggered compaction, as the read path does
    /// when a lookup crosses overlapping files.
    pub fn mark_read_compaction(&self, level: usize, file_num: u64) {
        self.inner
            .read_compactions
            .add(ReadCompaction { level, file_num });
    }

    fn run_pick(&self, pick: CompactionPick) -> Result<()> {
        let cmp = self.inner.cmp;
        let dir = &self.inner.dir;

        let mut iters: Vec<BoxedIterator<'static>> = Vec::new();
        let mut rangedels: Vec<Span> = Vec::new();
        let mut rangekeys: Vec<Span> = Vec::new();
        for file in pick.all_inputs() {
            let reader = file.open(cmp, dir)?;
            iters.push(Box::new(reader.iter()));
            rangedels.extend(reader.rangedel_spans());
            rangekeys.extend(reader.rangekey_spans());
        }
        let input = CompactionInput {
            point: MergingIter::new(cmp, iters),
            rangedels: fragment_all(cmp, rangedels),
            rangekeys: fragment_all(cmp, rangekeys),
        };

        // Bottommost when nothing below the output level overlaps the
        // compacted range.
        let version = self.inner.read_state.read()?.version.clone();
        let bottommost = match pick.user_range(cmp) {
            Some((start, end)) => (pick.output_level + 1..NUM_LEVELS)
                .all(|lv| version.overlaps(cmp, lv, &start, &end).is_empty()),
            None => true,
        };

        let params = CompactionParams {
            cmp,
            merge: self.inner.config.merge,
            dir,
            snapshots: self.inner.snapshots.seqs(),
            bottommost,
            target_file_size: self.inner.config.compaction.target_file_size,
            output_level: pick.output_level as u32,
            file_nums: &self.inner.next_file_num,
            shutting_down: Some(&self.inner.shutting_down),
        };
        let metas = run_compaction(&params, input)?;

        let new_version = {
            let mut vs = self.inner.versions.lock()?;
            let edit = VersionEdit {
                next_file_num: Some(self.inner.next_file_num.load(Ordering::SeqCst)),
                last_seq: Some(self.inner.last_seq.load(Ordering::Acquire)),
                removed: pick
                    .inputs
                    .iter()
                    .map(|f| (pick.level as u32, f.num))
                    .chain(
                        pick.output_inputs
                            .iter()
                            .map(|f| (pick.output_level as u32, f.num)),
                    )
                    .collect(),
                added: metas
                    .iter()
                    .map(|m| (pick.output_level as u32, m.clone()))
                    .collect(),
                ..VersionEdit::default()
            };
            vs.manifest.append(&edit)?;
            let next = Arc::new(vs.current.apply(cmp, &edit)?);
            self.inner.live_versions.register(&next);
            vs.current = Arc::clone(&next);
            vs.obsolete
                .extend(pick.all_inputs().map(|f| f.backing_num()));
            next
        };
        self.inner.read_state.write()?.version = new_version;
        self.cleanup_obsolete();

        Metrics::bump(&self.inner.metrics.compactions);
        if pick.reason == CompactionReason::ReadTriggered {
            Metrics::bump(&self.inner.metrics.read_compactions);
        }
        tracing::info!(
            level = pick.level,
            output_level = pick.output_level,
            inputs = pick.inputs.len() + pick.output_inputs.len(),
            outputs = metas.len(),
            reason = ?pick.reason,
            "compaction finished"
        );
        Ok(())
    }

    /// Deletes obsolete physical files no live version references.
    fn cleanup_obsolete(&self) {
        let Ok(mut vs) = self.inner.versions.lock() else {
            return;
        };
        if vs.obsolete.is_empty() {
            return;
        }
        let referenced = self.inner.live_versions.referenced_nums();
        let dir = self.inner.dir.clone();
        let metrics = &self.inner.metrics;
        vs.obsolete.retain(|num| {
            if referenced.contains(num) {
                return true;
            }
            match std::fs::remove_file(sst_path(&dir, *num)) {
                Ok(()) => {
                    Metrics::bump(&metrics.obsolete_files_deleted);
                    tracing::debug!(file_num = num, "deleted obsolete sstable");
                    false
                }
                Err(_) => false,
            }
        });
    }

    // Ingestion ------------------------------------------------------------

    /// Ingests pre-built sstables at the deepest legal level.
    pub fn ingest(&self, paths: &[PathBuf]) -> Result<()> {
        self.ingest_and_excise(paths, None)
    }

    /// Ingests pre-built sstables and atomically excises `[start, end)`:
    /// every existing file overlapping the span is replaced by virtual
    /// remnants outside it.
    pub fn ingest_and_excise(
        &self,
        paths: &[PathBuf],
        excise_range: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        self.check_writable()?;
        let cmp = self.inner.cmp;
        let files = ingest::validate_files(cmp, paths)?;
        if let Some((start, end)) = &excise_range {
            if cmp.cmp(start, end) != std::cmp::Ordering::Less {
                return errinput!("excise range end precedes start");
            }
        }
        let _guard = self.inner.major_ops.lock()?;
        // Exclude every other flush for the whole operation: nothing
        // committed after the ingest's sequence may reach a file before
        // the excise edit installs, or the excise would remove it.
        let _flush_guard = self.inner.flush_lock.lock()?;

        // Under the commit mutex no commit can slip between the overlap
        // check and the sequence assignment with a smaller sequence.
        // Memtables overlapping the ingested span (or the excise span)
        // would shadow the ingested seq once flushed, so they are frozen
        // here and flushed below before any file moves.
        let (seq, to_flush) = {
            let mut commit = self.inner.commit.lock()?;
            let needs_flush = {
                let rs = self.inner.read_state.read()?;
                let overlaps_mem = |start: &[u8], end: &[u8]| {
                    rs.active.overlaps(start, end)
                        || rs.immutables.iter().any(|m| m.overlaps(start, end))
                };
                files
                    .iter()
                    .any(|f| overlaps_mem(&f.smallest.user_key, &f.largest.user_key))
                    || excise_range
                        .as_ref()
                        .map(|(s, e)| overlaps_mem(s, e))
                        .unwrap_or(false)
                    || !rs.immutables.is_empty()
            };
            if needs_flush && !self.inner.read_state.read()?.active.is_empty() {
                self.rotate_memtable(&mut commit)?;
            }
            let seq = self.inner.last_seq.load(Ordering::Acquire) + 1;
            self.inner.last_seq.store(seq, Ordering::Release);
            let to_flush = if needs_flush {
                self.inner.read_state.read()?.immutables.clone()
            } else {
                Vec::new()
            };
            (seq, to_flush)
        };
        if !to_flush.is_empty() {
            let result = self.flush_mems(&to_flush);
            if let Err(e) = &result {
                self.latch_read_only(e);
            }
            result?;
        }

        let mut placed: Vec<(u64, u64)> = Vec::new();
        for file in &files {
            let num = self.inner.next_file_num.fetch_add(1, Ordering::SeqCst);
            let size = ingest::place_file(&file.path, &self.inner.dir, num)?;
            placed.push((num, size));
        }

        let result = (|| {
            let mut vs = self.inner.versions.lock()?;
            let (removed, mut added) = match &excise_range {
                Some((start, end)) => {
                    ingest::excise(cmp, &vs.current, start, end, &self.inner.next_file_num)
                }
                None => (Vec::new(), Vec::new()),
            };
            // Place against the post-excise shape.
            let tentative = vs.current.apply(
                cmp,
                &VersionEdit {
                    added: added.clone(),
                    removed: removed.clone(),
                    ..VersionEdit::default()
                },
            )?;
            for (file, (num, size)) in files.iter().zip(&placed) {
                let level = ingest::target_level(
                    cmp,
                    &tentative,
                    &file.smallest.user_key,
                    &file.largest.user_key,
                );
                added.push((
                    level as u32,
                    ingest::stamped_metadata(file, *num, seq, *size, level as u32),
                ));
            }

            let excised_backings: Vec<u64> = removed
                .iter()
                .filter_map(|(level, num)| {
                    vs.current.find(*level as usize, *num).map(|f| f.backing_num())
                })
                .collect();

            let edit = VersionEdit {
                next_file_num: Some(self.inner.next_file_num.load(Ordering::SeqCst)),
                last_seq: Some(seq),
                added,
                removed,
                ..VersionEdit::default()
            };
            vs.manifest.append(&edit)?;
            let next = Arc::new(vs.current.apply(cmp, &edit)?);
            self.inner.live_versions.register(&next);
            vs.current = Arc::clone(&next);
            vs.obsolete.extend(excised_backings.iter().copied());
            Ok((next, excised_backings.len()))
        })();
        let (new_version, excised) = match result {
            Ok(v) => v,
            Err(e) => {
                self.latch_read_only(&e);
                return Err(e);
            }
        };
        self.inner.read_state.write()?.version = new_version;
        self.cleanup_obsolete();

        Metrics::add(&self.inner.metrics.ingested_files, placed.len() as u64);
        Metrics::add(&self.inner.metrics.excised_files, excised as u64);
        tracing::info!(
            files = placed.len(),
            seq,
            excised,
            "ingested external sstables"
        );
        Ok(())
    }

    // Read path ------------------------------------------------------------

    /// Point lookup at the latest committed sequence.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_at(key, self.last_seq())
    }

    /// Point lookup at a sequence ceiling (`seq` inclusive).
    pub fn get_at(&self, key: &[u8], seq: u64) -> Result<Option<Vec<u8>>> {
        Metrics::bump(&self.inner.metrics.gets);
        self.note_read_overlap(key);
        let mut iter = self.iter_at(seq, IterOptions::default())?;
        iter.seek_ge(key)?;
        if iter.valid()
            && self.inner.cmp.cmp(iter.key(), key) == std::cmp::Ordering::Equal
        {
            Ok(iter.point_value().map(<[u8]>::to_vec))
        } else {
            Ok(None)
        }
    }

    /// Queues a read-triggered compaction when a lookup touches two or
    /// more overlapping files.
    fn note_read_overlap(&self, key: &[u8]) {
        let Ok(rs) = self.inner.read_state.read() else {
            return;
        };
        let version = &rs.version;
        let mut touched: Option<(usize, u64)> = None;
        let mut count = 0;
        for (level, files) in version.levels.iter().enumerate() {
            for file in files {
                if file.overlaps_range(self.inner.cmp, key, key) {
                    count += 1;
                    if touched.is_none() {
                        touched = Some((level, file.num));
                    }
                }
            }
        }
        if count >= 2 {
            if let Some((level, num)) = touched {
                if level + 1 < NUM_LEVELS {
                    self.inner.read_compactions.add(ReadCompaction {
                        level,
                        file_num: num,
                    });
                }
            }
        }
    }

    /// An iterator over the latest committed state.
    pub fn iter(&self, options: IterOptions) -> Result<DbIterator<'static>> {
        self.iter_at(self.last_seq(), options)
    }

    /// An iterator at a sequence ceiling.
    pub fn iter_at(&self, seq: u64, options: IterOptions) -> Result<DbIterator<'static>> {
        self.build_iter(seq, options, None)
    }

    /// An iterator merging an indexed batch's uncommitted state over the
    /// database.
    pub fn iter_with_batch<'a>(
        &self,
        batch: &'a Batch,
        options: IterOptions,
    ) -> Result<DbIterator<'a>> {
        self.build_iter(self.last_seq(), options, Some(batch))
    }

    fn build_iter<'a>(
        &self,
        visible_seq: u64,
        options: IterOptions,
        batch: Option<&'a Batch>,
    ) -> Result<DbIterator<'a>> {
        Metrics::bump(&self.inner.metrics.iterators_opened);
        let cmp = self.inner.cmp;
        let dir = &self.inner.dir;
        let (active, immutables, version) = {
            let rs = self.inner.read_state.read()?;
            (rs.active.clone(), rs.immutables.clone(), rs.version.clone())
        };

        let mut iters: Vec<BoxedIterator<'a>> = Vec::new();
        let mut rangedels: Vec<Span> = Vec::new();
        let mut rangekeys: Vec<Span> = Vec::new();

        if let Some(batch) = batch {
            if let Some(batch_iter) = batch.index_iter() {
                iters.push(Box::new(batch_iter));
            }
            rangedels.extend(batch.rangedel_spans(cmp, crate::key::BATCH_SEQ_BASE));
            rangekeys.extend(batch.rangekey_spans(cmp, crate::key::BATCH_SEQ_BASE));
        }

        iters.push(Box::new(active.point_iter()));
        rangedels.extend(active.rangedel_iter());
        rangekeys.extend(active.rangekey_iter());
        for mem in immutables.iter().rev() {
            iters.push(Box::new(mem.point_iter()));
            rangedels.extend(mem.rangedel_iter());
            rangekeys.extend(mem.rangekey_iter());
        }

        for file in &version.levels[0] {
            let reader = file.open(cmp, dir)?;
            iters.push(Box::new(reader.iter()));
            rangedels.extend(reader.rangedel_spans());
            rangekeys.extend(reader.rangekey_spans());
        }
        for level in 1..NUM_LEVELS {
            let files = version.levels[level].clone();
            if files.is_empty() {
                continue;
            }
            for file in &files {
                let reader = file.open(cmp, dir)?;
                rangedels.extend(reader.rangedel_spans());
                rangekeys.extend(reader.rangekey_spans());
            }
            iters.push(Box::new(LevelIter::new(cmp, dir.clone(), files)));
        }

        Ok(DbIterator::new(IterConfig {
            cmp,
            merge: self.inner.config.merge,
            visible_seq,
            point: MergingIter::new(cmp, iters),
            rangedels: fragment_all(cmp, rangedels),
            rangekeys: fragment_all(cmp, rangekeys),
            lower: options.lower,
            upper: options.upper,
            mask_suffix: options.mask_suffix,
            version: Some(version),
        }))
    }

    // Snapshots ------------------------------------------------------------

    /// Pins the current sequence number. Reads through the snapshot see
    /// exactly the state committed before it was taken.
    pub fn snapshot(&self) -> Snapshot {
        let seq = self.last_seq();
        self.inner.snapshots.acquire(seq);
        let version = self
            .inner
            .read_state
            .read()
            .map(|rs| rs.version.clone())
            .unwrap_or_default();
        Snapshot {
            seq,
            db: self.clone(),
            _version: version,
        }
    }

    // Checkpoint -----------------------------------------------------------

    /// Writes a crash-consistent hard-linked checkpoint under
    /// `checkpoints/<name>`, optionally restricted to files overlapping
    /// the given `[start, end)` intervals.
    pub fn checkpoint(
        &self,
        name: &str,
        restrict: Option<&[(Vec<u8>, Vec<u8>)]>,
    ) -> Result<PathBuf> {
        let mut commit = self.inner.commit.lock()?;
        commit.wal.sync()?;
        let vs = self.inner.versions.lock()?;
        let rs = self.inner.read_state.read()?;

        let mut wal_nums: Vec<u64> = rs.immutables.iter().map(|m| m.log_num()).collect();
        wal_nums.push(rs.active.log_num());
        wal_nums.sort_unstable();

        let target_dir = self.inner.dir.join("checkpoints").join(name);
        write_checkpoint(&CheckpointEnv {
            cmp: self.inner.cmp,
            db_dir: &self.inner.dir,
            target_dir: target_dir.clone(),
            version: &vs.current,
            restrict,
            next_file_num: self.inner.next_file_num.load(Ordering::SeqCst),
            last_seq: self.inner.last_seq.load(Ordering::Acquire),
            log_num: vs.log_num,
            min_unflushed_log_num: wal_nums.first().copied().unwrap_or(vs.log_num),
            wal_nums: &wal_nums,
            format_version: self.format_version(),
            options_file: Some(self.inner.options_file.clone()),
        })?;
        Ok(target_dir)
    }

    // Background work ------------------------------------------------------

    /// Starts the periodic flush, compaction, and metrics workers.
    /// Requires a tokio runtime.
    pub fn start_background(&self) {
        let mut guard = self.inner.maintenance.lock().unwrap();
        if guard.is_none() {
            *guard = Some(Maintenance::start(self));
        }
    }

    /// Stops background work and syncs the WAL. The handle remains usable
    /// for reads.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let maintenance = self.inner.maintenance.lock().unwrap().take();
        if let Some(maintenance) = maintenance {
            maintenance.stop().await?;
        }
        let mut commit = self.inner.commit.lock()?;
        commit.wal.sync()?;
        tracing::info!(dir = %self.inner.dir.display(), "closed database");
        Ok(())
    }

    /// Level shapes for introspection and the driver's `lsm` command.
    pub fn describe_levels(&self) -> String {
        let version = match self.inner.read_state.read() {
            Ok(rs) => rs.version.clone(),
            Err(_) => return String::new(),
        };
        let mut out = String::new();
        for (level, files) in version.levels.iter().enumerate() {
            if files.is_empty() {
                continue;
            }
            let rendered = files
                .iter()
                .map(|f| {
                    format!(
                        "{:06}{}[{}..{}]",
                        f.num,
                        if f.is_virtual() { "v" } else { "" },
                        String::from_utf8_lossy(&f.smallest.user_key),
                        String::from_utf8_lossy(&f.largest.user_key),
                    )
                })
                .join(" ");
            out.push_str(&format!("L{level}: {rendered}\n"));
        }
        out
    }

    /// The current version's file numbers per level, for tests.
    pub fn level_file_nums(&self) -> Vec<Vec<u64>> {
        match self.inner.read_state.read() {
            Ok(rs) => rs
                .version
                .levels
                .iter()
                .map(|files| files.iter().map(|f| f.num).collect())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Physical files referenced by live versions, for tests.
    pub fn referenced_file_nums(&self) -> HashSet<u64> {
        self.inner.live_versions.referenced_nums()
    }
}

/// A pinned read view. Dropping releases the pinned sequence.
pub struct Snapshot {
    seq: u64,
    db: Db,
    _version: Arc<Version>,
}

impl Snapshot {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get_at(key, self.seq)
    }

    pub fn iter(&self, options: IterOptions) -> Result<DbIterator<'static>> {
        self.db.iter_at(self.seq, options)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.db.inner.snapshots.release(self.seq);
    }
}

#[cfg(test)]
mod tests;
