//! Versions: immutable snapshots of the file set.
//!
//! A [`Version`] maps each level to an ordered list of refcounted
//! [`FileMetadata`] handles. Installing a manifest edit produces a new
//! version; readers pin the version they started on via `Arc`, and a
//! registry of weak handles decides when an obsolete physical file, one no
//! live version references directly or through a virtual file, may be
//! deleted.

pub mod edit;
pub mod manifest;
pub mod picker;

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use crate::comparator::Comparator;
use crate::errcorrupt;
use crate::error::Result;
use crate::key::{make_trailer, InternalKey, KeyKind, SEQ_INF};
use crate::sstable::{sst_path, TableReader};

pub const NUM_LEVELS: usize = 7;

/// Restriction of a physical backing file to a sub-range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualBounds {
    pub backing_num: u64,
    /// Inclusive internal-key window. An upper bound with the `inf`
    /// sentinel trailer excludes its user key entirely.
    pub lower: InternalKey,
    pub upper: InternalKey,
}

/// Metadata for one sstable referenced by a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Stable file number; never reused.
    pub num: u64,
    pub size: u64,
    /// Overall bounds across point and range families.
    pub smallest: InternalKey,
    pub largest: InternalKey,
    pub smallest_point: Option<InternalKey>,
    pub largest_point: Option<InternalKey>,
    pub smallest_range: Option<InternalKey>,
    pub largest_range: Option<InternalKey>,
    pub smallest_seq: u64,
    pub largest_seq: u64,
    /// Level the file was created at.
    pub creation_level: u32,
    /// Present for virtual files.
    pub virtual_bounds: Option<VirtualBounds>,
    /// Sequence number stamped over every key at read time (ingested
    /// files).
    pub seq_override: Option<u64>,
}

impl FileMetadata {
    /// The physical file backing this entry.
    pub fn backing_num(&self) -> u64 {
        self.virtual_bounds
            .as_ref()
            .map(|v| v.backing_num)
            .unwrap_or(self.num)
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_bounds.is_some()
    }

    /// Whether the file's user-key range intersects `[start, end]`
    /// (inclusive; an exclusive-sentinel largest bound excludes its user
    /// key).
    pub fn overlaps_range(&self, cmp: &Comparator, start: &[u8], end: &[u8]) -> bool {
        if cmp.cmp(&self.smallest.user_key, end) == CmpOrdering::Greater {
            return false;
        }
        match cmp.cmp(start, &self.largest.user_key) {
            CmpOrdering::Less => true,
            CmpOrdering::Equal => !self.largest_is_exclusive(),
            CmpOrdering::Greater => false,
        }
    }

    /// Whether `largest` is a range-end sentinel, making its user key an
    /// exclusive bound.
    pub fn largest_is_exclusive(&self) -> bool {
        self.largest.trailer == make_trailer(SEQ_INF, KeyKind::RangeDelete)
    }

    /// Opens a reader honoring virtual bounds and the ingestion seq stamp.
    pub fn open(&self, cmp: &'static Comparator, dir: &Path) -> Result<Arc<TableReader>> {
        let path = sst_path(dir, self.backing_num());
        let bounds = self
            .virtual_bounds
            .as_ref()
            .map(|v| (v.lower.clone(), v.upper.clone()));
        Ok(Arc::new(TableReader::open_with(
            cmp,
            path,
            bounds,
            self.seq_override,
        )?))
    }
}

/// An immutable `{level -> ordered files}` snapshot.
#[derive(Debug, Clone, Default)]
pub struct Version {
    pub levels: [Vec<Arc<FileMetadata>>; NUM_LEVELS],
}

impl Version {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level_size(&self, level: usize) -> u64 {
        self.levels[level].iter().map(|f| f.size).sum()
    }

    pub fn num_files(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_files() == 0
    }

    /// Files at `level` whose user-key ranges intersect `[start, end]`.
    pub fn overlaps(
        &self,
        cmp: &Comparator,
        level: usize,
        start: &[u8],
        end: &[u8],
    ) -> Vec<Arc<FileMetadata>> {
        self.levels[level]
            .iter()
            .filter(|f| f.overlaps_range(cmp, start, end))
            .cloned()
            .collect()
    }

    /// The deepest level containing no files; `None` when every level is
    /// populated.
    pub fn deepest_empty_level(&self) -> Option<usize> {
        (0..NUM_LEVELS).rev().find(|&l| self.levels[l].is_empty())
    }

    /// Greedy L0 sublevel count: files stack newest-first into the first
    /// sublevel where they do not overlap.
    pub fn l0_sublevels(&self, cmp: &Comparator) -> usize {
        let mut sublevels: Vec<Vec<&Arc<FileMetadata>>> = Vec::new();
        for file in &self.levels[0] {
            let slot = sublevels.iter_mut().find(|s| {
                !s.iter()
                    .any(|f| f.overlaps_range(cmp, &file.smallest.user_key, &file.largest.user_key))
            });
            match slot {
                Some(s) => s.push(file),
                None => sublevels.push(vec![file]),
            }
        }
        sublevels.len()
    }

    /// Sorts levels into canonical order: L0 newest-first by seq, deeper
    /// levels by smallest key.
    fn sort(&mut self, cmp: &Comparator) {
        self.levels[0].sort_by(|a, b| {
            b.largest_seq
                .cmp(&a.largest_seq)
                .then_with(|| b.num.cmp(&a.num))
        });
        for level in self.levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.smallest.cmp_with(cmp, &b.smallest));
        }
    }

    /// Checks the level invariants: deeper levels hold files with disjoint
    /// user-key ranges in sorted order, and file numbers are unique.
    pub fn validate(&self, cmp: &Comparator) -> Result<()> {
        let mut seen = HashSet::new();
        for (level, files) in self.levels.iter().enumerate() {
            for file in files {
                if !seen.insert(file.num) {
                    return errcorrupt!("file {:06} appears twice in version", file.num);
                }
            }
            if level == 0 {
                continue;
            }
            for pair in files.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                let disjoint = cmp.cmp(&a.largest.user_key, &b.smallest.user_key)
                    == CmpOrdering::Less
                    || (cmp.cmp(&a.largest.user_key, &b.smallest.user_key) == CmpOrdering::Equal
                        && a.largest_is_exclusive());
                if !disjoint {
                    return errcorrupt!(
                        "level {level} files {:06} and {:06} overlap",
                        a.num,
                        b.num
                    );
                }
            }
        }
        Ok(())
    }

    /// Every physical file number this version references, backing files
    /// included.
    pub fn referenced_nums(&self) -> HashSet<u64> {
        self.levels
            .iter()
            .flatten()
            .map(|f| f.backing_num())
            .collect()
    }

    /// Looks up a file by number at `level`.
    pub fn find(&self, level: usize, num: u64) -> Option<Arc<FileMetadata>> {
        self.levels[level].iter().find(|f| f.num == num).cloned()
    }
}

/// Registry of versions that may still be serving readers.
#[derive(Default)]
pub struct LiveVersions {
    inner: Mutex<Vec<Weak<Version>>>,
}

impl LiveVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, version: &Arc<Version>) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|w| w.strong_count() > 0);
        inner.push(Arc::downgrade(version));
    }

    /// Physical file numbers referenced by any version still alive.
    pub fn referenced_nums(&self) -> HashSet<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|w| w.strong_count() > 0);
        let mut nums = HashSet::new();
        for weak in inner.iter() {
            if let Some(version) = weak.upgrade() {
                nums.extend(version.referenced_nums());
            }
        }
        nums
    }
}
