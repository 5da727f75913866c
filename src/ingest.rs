//! Ingestion of pre-built sstables.
//!
//! External files are validated (internally ordered by construction,
//! mutually disjoint, every sequence number zero on disk), stamped with a
//! single sequence number assigned at commit, and placed at the deepest
//! level where nothing above or at the level overlaps them. Excise
//! replaces every existing file overlapping a span with up to two virtual
//! children reading narrower windows of the same backing file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::comparator::Comparator;
use crate::errinput;
use crate::error::Result;
use crate::key::{make_trailer, InternalKey, SEQ_INF};
use crate::sstable::{TableProps, TableReader};
use crate::version::{FileMetadata, Version, VirtualBounds, NUM_LEVELS};

/// A validated external file awaiting placement.
pub struct IngestFile {
    pub path: PathBuf,
    pub props: TableProps,
    pub smallest: InternalKey,
    pub largest: InternalKey,
}

/// Opens and validates the external files: each must be non-empty with
/// every sequence number zero, and the set must be disjoint under `cmp`.
/// Returns the files sorted by smallest key.
pub fn validate_files(cmp: &'static Comparator, paths: &[PathBuf]) -> Result<Vec<IngestFile>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let reader = TableReader::open(cmp, path)?;
        let props = reader.props().clone();
        let (Some(smallest), Some(largest)) = (props.smallest(cmp), props.largest(cmp)) else {
            return errinput!("ingested file {} is empty", path.display());
        };
        if props.largest_seq != 0 {
            return errinput!(
                "ingested file {} carries nonzero sequence numbers",
                path.display()
            );
        }
        files.push(IngestFile {
            path: path.clone(),
            props,
            smallest,
            largest,
        });
    }
    files.sort_by(|a, b| a.smallest.cmp_with(cmp, &b.smallest));
    for pair in files.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if cmp.cmp(&a.largest.user_key, &b.smallest.user_key) != std::cmp::Ordering::Less {
            return errinput!(
                "ingested files {} and {} overlap",
                a.path.display(),
                b.path.display()
            );
        }
    }
    Ok(files)
}

/// The deepest level whose files, and those of every shallower level, do
/// not overlap `[start, end]`.
pub fn target_level(cmp: &Comparator, version: &Version, start: &[u8], end: &[u8]) -> usize {
    let mut target = 0;
    for level in 0..NUM_LEVELS {
        if !version.overlaps(cmp, level, start, end).is_empty() {
            break;
        }
        target = level;
    }
    target
}

/// Builds the metadata for an ingested file stamped with `seq`.
pub fn stamped_metadata(
    file: &IngestFile,
    num: u64,
    seq: u64,
    size: u64,
    level: u32,
) -> FileMetadata {
    let stamp = |key: &InternalKey| -> InternalKey {
        let kind = crate::key::trailer_kind(key.trailer).expect("valid stored kind");
        let stamped_seq = if key.seq() == SEQ_INF { SEQ_INF } else { seq };
        InternalKey {
            user_key: key.user_key.clone(),
            trailer: make_trailer(stamped_seq, kind),
        }
    };
    FileMetadata {
        num,
        size,
        smallest: stamp(&file.smallest),
        largest: stamp(&file.largest),
        smallest_point: file.props.smallest_point.as_ref().map(&stamp),
        largest_point: file.props.largest_point.as_ref().map(&stamp),
        smallest_range: file.props.smallest_range.as_ref().map(&stamp),
        largest_range: file.props.largest_range.as_ref().map(&stamp),
        smallest_seq: seq,
        largest_seq: seq,
        creation_level: level,
        virtual_bounds: None,
        seq_override: Some(seq),
    }
}

/// Files overlapping the excise span `[start, end)` and their virtual
/// replacements. Returns `(removed, added)` for the manifest edit.
pub fn excise(
    cmp: &Comparator,
    version: &Version,
    start: &[u8],
    end: &[u8],
    file_nums: &AtomicU64,
) -> (Vec<(u32, u64)>, Vec<(u32, FileMetadata)>) {
    let mut removed = Vec::new();
    let mut added = Vec::new();
    for (level, files) in version.levels.iter().enumerate() {
        for file in files {
            if !file.overlaps_range(cmp, start, end) {
                continue;
            }
            // The inclusive overlap probe admits a file starting exactly at
            // the exclusive end; skip it.
            if cmp.cmp(&file.smallest.user_key, end) != std::cmp::Ordering::Less {
                continue;
            }
            removed.push((level as u32, file.num));

            let backing_num = file.backing_num();
            // Left remnant: keys strictly below the excised span.
            if cmp.cmp(&file.smallest.user_key, start) == std::cmp::Ordering::Less {
                let upper = InternalKey::range_end_sentinel(start);
                let num = file_nums.fetch_add(1, Ordering::SeqCst);
                added.push((
                    level as u32,
                    FileMetadata {
                        num,
                        size: (file.size / 2).max(1),
                        smallest: file.smallest.clone(),
                        largest: upper.clone(),
                        smallest_point: file.smallest_point.clone(),
                        largest_point: None,
                        smallest_range: file.smallest_range.clone(),
                        largest_range: None,
                        smallest_seq: file.smallest_seq,
                        largest_seq: file.largest_seq,
                        creation_level: file.creation_level,
                        virtual_bounds: Some(VirtualBounds {
                            backing_num,
                            lower: file.smallest.clone(),
                            upper,
                        }),
                        seq_override: file.seq_override,
                    },
                ));
            }
            // Right remnant: keys at or above the excised span's end.
            let has_right = match cmp.cmp(&file.largest.user_key, end) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => !file.largest_is_exclusive(),
                std::cmp::Ordering::Less => false,
            };
            if has_right {
                let lower = InternalKey::range_end_sentinel(end);
                let num = file_nums.fetch_add(1, Ordering::SeqCst);
                added.push((
                    level as u32,
                    FileMetadata {
                        num,
                        size: (file.size / 2).max(1),
                        smallest: lower.clone(),
                        largest: file.largest.clone(),
                        smallest_point: None,
                        largest_point: file.largest_point.clone(),
                        smallest_range: None,
                        largest_range: file.largest_range.clone(),
                        smallest_seq: file.smallest_seq,
                        largest_seq: file.largest_seq,
                        creation_level: file.creation_level,
                        virtual_bounds: Some(VirtualBounds {
                            backing_num,
                            lower,
                            upper: file.largest.clone(),
                        }),
                        seq_override: file.seq_override,
                    },
                ));
            }
        }
    }
    (removed, added)
}

/// Copies an external file into the database directory under its assigned
/// number, via a temporary name renamed on completion.
pub fn place_file(src: &Path, dir: &Path, num: u64) -> Result<u64> {
    let tmp = dir.join(format!("temporary.{num:06}.dbtmp"));
    std::fs::copy(src, &tmp)?;
    let dst = crate::sstable::sst_path(dir, num);
    std::fs::rename(&tmp, &dst)?;
    let size = std::fs::metadata(&dst)?.len();
    Ok(size)
}
