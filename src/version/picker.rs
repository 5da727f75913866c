//! Compaction picking.
//!
//! Levels are scored (L0 by file and sublevel count against its threshold,
//! deeper levels by size against a geometrically growing target) and the
//! highest score at or above 1.0 wins, ties to the shallower level. Inputs grow to the overlap closure across the input and output
//! levels so a compaction never splits files that must move together.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{FileMetadata, Version, NUM_LEVELS};
use crate::comparator::Comparator;
use crate::config::CompactionConfig;

/// Why a compaction was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    Score,
    Manual,
    ReadTriggered,
}

/// A picked compaction: inputs at `level` merging into `output_level`.
#[derive(Debug)]
pub struct CompactionPick {
    pub level: usize,
    pub output_level: usize,
    pub inputs: Vec<Arc<FileMetadata>>,
    pub output_inputs: Vec<Arc<FileMetadata>>,
    pub reason: CompactionReason,
}

impl CompactionPick {
    pub fn all_inputs(&self) -> impl Iterator<Item = &Arc<FileMetadata>> {
        self.inputs.iter().chain(self.output_inputs.iter())
    }

    /// User-key range spanned by every input.
    pub fn user_range(&self, cmp: &Comparator) -> Option<(Vec<u8>, Vec<u8>)> {
        let mut range: Option<(Vec<u8>, Vec<u8>)> = None;
        for f in self.all_inputs() {
            let (lo, hi) = (&f.smallest.user_key, &f.largest.user_key);
            range = Some(match range {
                None => (lo.clone(), hi.clone()),
                Some((cur_lo, cur_hi)) => (
                    if cmp.cmp(lo, &cur_lo) == std::cmp::Ordering::Less {
                        lo.clone()
                    } else {
                        cur_lo
                    },
                    if cmp.cmp(hi, &cur_hi) == std::cmp::Ordering::Greater {
                        hi.clone()
                    } else {
                        cur_hi
                    },
                ),
            });
        }
        range
    }
}

/// Size target for a level.
pub fn level_target(config: &CompactionConfig, level: usize) -> u64 {
    let mut target = config.level_base_size;
    for _ in 1..level {
        target = target.saturating_mul(config.level_size_multiplier);
    }
    target
}

/// Per-level compaction scores. The bottommost level is never scored.
pub fn level_scores(cmp: &Comparator, version: &Version, config: &CompactionConfig) -> Vec<f64> {
    let mut scores = vec![0.0; NUM_LEVELS];
    let l0_files = version.levels[0].len();
    let l0_sublevels = version.l0_sublevels(cmp);
    scores[0] = l0_files.max(l0_sublevels) as f64 / config.l0_compaction_threshold as f64;
    for (level, score) in scores.iter_mut().enumerate().take(NUM_LEVELS - 1).skip(1) {
        *score = version.level_size(level) as f64 / level_target(config, level) as f64;
    }
    scores
}

/// Expands `inputs` at `level` to the overlap closure across `level` and
/// `level + 1`: files keep joining while the union user-key range touches
/// more of them. Returns `(inputs, output_inputs)`.
pub fn expand_inputs(
    cmp: &Comparator,
    version: &Version,
    level: usize,
    output_level: usize,
    mut inputs: Vec<Arc<FileMetadata>>,
) -> (Vec<Arc<FileMetadata>>, Vec<Arc<FileMetadata>>) {
    let mut output_inputs: Vec<Arc<FileMetadata>> = Vec::new();
    loop {
        let mut start: Option<Vec<u8>> = None;
        let mut end: Option<Vec<u8>> = None;
        for f in inputs.iter().chain(output_inputs.iter()) {
            if start
                .as_ref()
                .map(|s| cmp.cmp(&f.smallest.user_key, s) == std::cmp::Ordering::Less)
                .unwrap_or(true)
            {
                start = Some(f.smallest.user_key.clone());
            }
            if end
                .as_ref()
                .map(|e| cmp.cmp(&f.largest.user_key, e) == std::cmp::Ordering::Greater)
                .unwrap_or(true)
            {
                end = Some(f.largest.user_key.clone());
            }
        }
        let (Some(start), Some(end)) = (start, end) else {
            return (inputs, output_inputs);
        };

        let mut grown = false;
        for f in version.overlaps(cmp, level, &start, &end) {
            if !inputs.iter().any(|i| i.num == f.num) {
                inputs.push(f);
                grown = true;
            }
        }
        if output_level != level {
            for f in version.overlaps(cmp, output_level, &start, &end) {
                if !output_inputs.iter().any(|i| i.num == f.num) {
                    output_inputs.push(f);
                    grown = true;
                }
            }
        }
        if !grown {
            return (inputs, output_inputs);
        }
    }
}

/// Picks the highest-scoring compaction, if any level scores at least 1.0.
pub fn pick_compaction(
    cmp: &Comparator,
    version: &Version,
    config: &CompactionConfig,
) -> Option<CompactionPick> {
    let scores = level_scores(cmp, version, config);
    let mut best: Option<(usize, f64)> = None;
    for (level, score) in scores.iter().enumerate() {
        if *score >= 1.0 && best.map(|(_, s)| *score > s).unwrap_or(true) {
            best = Some((level, *score));
        }
    }
    let (level, _) = best?;
    let output_level = level + 1;

    let seeds = if level == 0 {
        version.levels[0].to_vec()
    } else {
        // Seed with the largest file; the closure grows from there.
        let seed = version.levels[level]
            .iter()
            .max_by_key(|f| (f.size, f.num))?
            .clone();
        vec![seed]
    };
    let (inputs, output_inputs) = expand_inputs(cmp, version, level, output_level, seeds);
    Some(CompactionPick {
        level,
        output_level,
        inputs,
        output_inputs,
        reason: CompactionReason::Score,
    })
}

/// Builds a manual compaction over every file at `level`.
pub fn pick_manual(
    cmp: &Comparator,
    version: &Version,
    level: usize,
) -> Option<CompactionPick> {
    if version.levels[level].is_empty() || level + 1 >= NUM_LEVELS {
        return None;
    }
    let (inputs, output_inputs) = expand_inputs(
        cmp,
        version,
        level,
        level + 1,
        version.levels[level].to_vec(),
    );
    Some(CompactionPick {
        level,
        output_level: level + 1,
        inputs,
        output_inputs,
        reason: CompactionReason::Manual,
    })
}

/// A file marked for compaction because a read touched overlapping files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCompaction {
    pub level: usize,
    pub file_num: u64,
}

/// Pending read-triggered compactions.
#[derive(Default)]
pub struct ReadCompactionQueue {
    inner: Mutex<VecDeque<ReadCompaction>>,
}

impl ReadCompactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rc: ReadCompaction) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.contains(&rc) {
            inner.push_back(rc);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Pops entries until one names a file the version still holds at the
    /// same level; stale entries are dropped.
    pub fn pop_valid(&self, cmp: &Comparator, version: &Version) -> Option<CompactionPick> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(rc) = inner.pop_front() {
            if rc.level + 1 >= NUM_LEVELS {
                continue;
            }
            let Some(file) = version.find(rc.level, rc.file_num) else {
                tracing::debug!(
                    level = rc.level,
                    file_num = rc.file_num,
                    "skipping stale read-triggered compaction"
                );
                continue;
            };
            let (inputs, output_inputs) =
                expand_inputs(cmp, version, rc.level, rc.level + 1, vec![file]);
            return Some(CompactionPick {
                level: rc.level,
                output_level: rc.level + 1,
                inputs,
                output_inputs,
                reason: CompactionReason::ReadTriggered,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BYTEWISE;
    use crate::key::{InternalKey, KeyKind};

    fn meta(num: u64, smallest: &[u8], largest: &[u8], size: u64) -> Arc<FileMetadata> {
        Arc::new(FileMetadata {
            num,
            size,
            smallest: InternalKey::new(smallest, 1, KeyKind::Set),
            largest: InternalKey::new(largest, 1, KeyKind::Set),
            smallest_point: Some(InternalKey::new(smallest, 1, KeyKind::Set)),
            largest_point: Some(InternalKey::new(largest, 1, KeyKind::Set)),
            smallest_range: None,
            largest_range: None,
            smallest_seq: 1,
            largest_seq: 1,
            creation_level: 0,
            virtual_bounds: None,
            seq_override: None,
        })
    }

    fn config() -> CompactionConfig {
        CompactionConfig::default()
            .l0_compaction_threshold(4)
            .level_base_size(1000)
            .level_size_multiplier(10)
    }

    #[test]
    fn geometric_targets() {
        let c = config();
        assert_eq!(level_target(&c, 1), 1000);
        assert_eq!(level_target(&c, 2), 10_000);
        assert_eq!(level_target(&c, 3), 100_000);
    }

    #[test]
    fn l0_scores_by_file_count() {
        let mut v = Version::new();
        for i in 0..4 {
            v.levels[0].push(meta(i + 1, b"a", b"z", 10));
        }
        let scores = level_scores(&BYTEWISE, &v, &config());
        assert!(scores[0] >= 1.0);

        let pick = pick_compaction(&BYTEWISE, &v, &config()).unwrap();
        assert_eq!(pick.level, 0);
        assert_eq!(pick.output_level, 1);
        assert_eq!(pick.inputs.len(), 4);
    }

    #[test]
    fn oversized_level_beats_l0() {
        let mut v = Version::new();
        v.levels[0].push(meta(1, b"a", b"z", 10));
        v.levels[1].push(meta(2, b"a", b"m", 3000));
        let pick = pick_compaction(&BYTEWISE, &v, &config()).unwrap();
        assert_eq!(pick.level, 1);
        assert_eq!(pick.output_level, 2);
    }

    #[test]
    fn shallower_level_wins_ties() {
        let mut v = Version::new();
        // Both L1 and L2 score 2.0 exactly.
        v.levels[1].push(meta(1, b"a", b"m", 2000));
        v.levels[2].push(meta(2, b"a", b"m", 20_000));
        let pick = pick_compaction(&BYTEWISE, &v, &config()).unwrap();
        assert_eq!(pick.level, 1);
    }

    #[test]
    fn nothing_to_pick_below_threshold() {
        let mut v = Version::new();
        v.levels[0].push(meta(1, b"a", b"z", 10));
        assert!(pick_compaction(&BYTEWISE, &v, &config()).is_none());
    }

    #[test]
    fn expansion_pulls_overlapping_output_files() {
        let mut v = Version::new();
        v.levels[1].push(meta(1, b"c", b"h", 10));
        v.levels[2].push(meta(2, b"a", b"d", 10));
        v.levels[2].push(meta(3, b"g", b"k", 10));
        v.levels[2].push(meta(4, b"m", b"p", 10));

        let (inputs, outputs) =
            expand_inputs(&BYTEWISE, &v, 1, 2, vec![v.levels[1][0].clone()]);
        assert_eq!(inputs.len(), 1);
        let mut nums: Vec<u64> = outputs.iter().map(|f| f.num).collect();
        nums.sort_unstable();
        assert_eq!(nums, vec![2, 3]);
    }

    #[test]
    fn expansion_reaches_fixpoint_through_widening() {
        let mut v = Version::new();
        // Seed [e,f] pulls L2 [d,g], which pulls L1 [c,d] via the widened
        // range, which pulls L2 [a,c].
        v.levels[1].push(meta(1, b"e", b"f", 10));
        v.levels[1].push(meta(2, b"c", b"d", 10));
        v.levels[2].push(meta(3, b"d", b"g", 10));
        v.levels[2].push(meta(4, b"a", b"c", 10));

        let (inputs, outputs) =
            expand_inputs(&BYTEWISE, &v, 1, 2, vec![v.levels[1][0].clone()]);
        assert_eq!(inputs.len(), 2);
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn read_queue_validates_against_version() {
        let mut v = Version::new();
        v.levels[5].push(meta(7, b"a", b"c", 10));
        v.levels[6].push(meta(8, b"a", b"c", 10));

        let queue = ReadCompactionQueue::new();
        queue.add(ReadCompaction { level: 5, file_num: 7 });
        // Duplicates collapse.
        queue.add(ReadCompaction { level: 5, file_num: 7 });
        assert_eq!(queue.len(), 1);

        let pick = queue.pop_valid(&BYTEWISE, &v).unwrap();
        assert_eq!(pick.level, 5);
        assert_eq!(pick.output_level, 6);
        assert_eq!(pick.inputs[0].num, 7);
        assert_eq!(pick.output_inputs[0].num, 8);
        assert!(queue.is_empty());

        // A stale entry (file replaced) is skipped.
        queue.add(ReadCompaction { level: 5, file_num: 99 });
        assert!(queue.pop_valid(&BYTEWISE, &v).is_none());
    }
}
