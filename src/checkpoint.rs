//! Checkpoints: crash-consistent hard-linked copies of the LSM.
//!
//! Referenced sstables are hard-linked into `checkpoints/<name>/`; the
//! checkpoint gets a fresh manifest whose first edit snapshots the full
//! file set and whose second edit removes files excluded by the
//! restriction, so the exclusion is recorded rather than silent. The
//! active WAL tail is copied (not linked) because the source keeps
//! appending to it. A backing file is linked only when an included virtual
//! file needs it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::comparator::Comparator;
use crate::error::Result;
use crate::version::manifest::{
    manifest_path, move_marker, sync_dir, Manifest, FORMAT_MARKER, MANIFEST_MARKER,
};
use crate::version::{edit::VersionEdit, Version};
use crate::wal::log_path;

pub struct CheckpointEnv<'a> {
    pub cmp: &'a Comparator,
    pub db_dir: &'a Path,
    pub target_dir: PathBuf,
    pub version: &'a Version,
    /// User-key intervals `[start, end)`; files overlapping none of them
    /// are excluded and recorded as removed. None copies everything.
    pub restrict: Option<&'a [(Vec<u8>, Vec<u8>)]>,
    pub next_file_num: u64,
    pub last_seq: u64,
    pub log_num: u64,
    pub min_unflushed_log_num: u64,
    /// WAL segments still needed for recovery, ascending.
    pub wal_nums: &'a [u64],
    pub format_version: u32,
    pub options_file: Option<PathBuf>,
}

fn file_included(
    cmp: &Comparator,
    restrict: Option<&[(Vec<u8>, Vec<u8>)]>,
    file: &crate::version::FileMetadata,
) -> bool {
    let Some(intervals) = restrict else {
        return true;
    };
    intervals.iter().any(|(start, end)| {
        // End-exclusive interval against the file's user range.
        cmp.cmp(&file.smallest.user_key, end) == std::cmp::Ordering::Less
            && match cmp.cmp(start, &file.largest.user_key) {
                std::cmp::Ordering::Less | std::cmp::Ordering::Equal => {
                    !(cmp.cmp(start, &file.largest.user_key) == std::cmp::Ordering::Equal
                        && file.largest_is_exclusive())
                }
                std::cmp::Ordering::Greater => false,
            }
    })
}

/// Writes the checkpoint. The caller must hold the manifest writer lock so
/// the version and counters stay coherent while files are linked.
pub fn write_checkpoint(env: &CheckpointEnv) -> Result<()> {
    fs::create_dir_all(&env.target_dir)?;

    // Decide inclusion per file entry, then link each needed physical
    // backing exactly once.
    let mut linked: HashSet<u64> = HashSet::new();
    let mut removed: Vec<(u32, u64)> = Vec::new();
    let mut added: Vec<(u32, crate::version::FileMetadata)> = Vec::new();
    for (level, files) in env.version.levels.iter().enumerate() {
        for file in files {
            added.push((level as u32, (**file).clone()));
            if file_included(env.cmp, env.restrict, file) {
                let backing = file.backing_num();
                if linked.insert(backing) {
                    let src = crate::sstable::sst_path(env.db_dir, backing);
                    let dst = crate::sstable::sst_path(&env.target_dir, backing);
                    fs::hard_link(&src, &dst)?;
                }
            } else {
                removed.push((level as u32, file.num));
            }
        }
    }

    // Fresh manifest: a full snapshot edit, then the exclusions.
    let mut manifest = Manifest::create(&env.target_dir, 1)?;
    manifest.append(&VersionEdit {
        comparator_name: Some(env.cmp.name.to_string()),
        next_file_num: Some(env.next_file_num),
        last_seq: Some(env.last_seq),
        log_num: Some(env.log_num),
        min_unflushed_log_num: Some(env.min_unflushed_log_num),
        added,
        removed: Vec::new(),
    })?;
    if !removed.is_empty() {
        manifest.append(&VersionEdit {
            removed,
            ..VersionEdit::default()
        })?;
    }

    // WAL tails are copied, not linked: the source keeps appending.
    for num in env.wal_nums {
        let src = log_path(env.db_dir, *num);
        if src.exists() {
            fs::copy(&src, log_path(&env.target_dir, *num))?;
        }
    }

    if let Some(options) = &env.options_file {
        if options.exists() {
            let name = options.file_name().expect("options file has a name");
            fs::copy(options, env.target_dir.join(name))?;
        }
    }

    move_marker(
        &env.target_dir,
        MANIFEST_MARKER,
        &manifest_path(&env.target_dir, 1)
            .file_name()
            .expect("manifest file has a name")
            .to_string_lossy(),
    )?;
    move_marker(&env.target_dir, FORMAT_MARKER, &env.format_version.to_string())?;
    sync_dir(&env.target_dir)?;

    tracing::info!(
        target = %env.target_dir.display(),
        linked = linked.len(),
        "wrote checkpoint"
    );
    Ok(())
}
