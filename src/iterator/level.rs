//! Level iterator.
//!
//! Iterates the ordered, disjoint files of one level (L1 and deeper),
//! holding exactly one table open at a time. Seeks binary-search the
//! level's file table; running off a file's end lazily opens its
//! neighbor. Virtual files clamp themselves when opened.

use std::path::PathBuf;
use std::sync::Arc;

use super::InternalIterator;
use crate::comparator::Comparator;
use crate::error::Result;
use crate::key::InternalKey;
use crate::sstable::TableIter;
use crate::version::FileMetadata;

pub struct LevelIter {
    cmp: &'static Comparator,
    dir: PathBuf,
    /// Sorted by smallest key, pairwise disjoint.
    files: Vec<Arc<FileMetadata>>,
    file_idx: usize,
    table: Option<TableIter>,
    valid: bool,
}

impl LevelIter {
    pub fn new(cmp: &'static Comparator, dir: PathBuf, files: Vec<Arc<FileMetadata>>) -> Self {
        Self {
            cmp,
            dir,
            files,
            file_idx: 0,
            table: None,
            valid: false,
        }
    }

    fn open(&mut self, idx: usize) -> Result<&mut TableIter> {
        let reader = self.files[idx].open(self.cmp, &self.dir)?;
        self.table = Some(reader.iter());
        self.file_idx = idx;
        Ok(self.table.as_mut().expect("just opened"))
    }

    /// Advances through files starting at `idx` until one yields a valid
    /// position from `position`.
    fn forward_from(&mut self, idx: usize, mut position: impl FnMut(&mut TableIter) -> Result<()>) -> Result<()> {
        let mut idx = idx;
        while idx < self.files.len() {
            let table = self.open(idx)?;
            position(table)?;
            if table.valid() {
                self.valid = true;
                return Ok(());
            }
            idx += 1;
        }
        self.valid = false;
        Ok(())
    }

    fn backward_from(&mut self, idx: usize, mut position: impl FnMut(&mut TableIter) -> Result<()>) -> Result<()> {
        let mut idx = idx as isize;
        while idx >= 0 {
            let table = self.open(idx as usize)?;
            position(table)?;
            if table.valid() {
                self.valid = true;
                return Ok(());
            }
            idx -= 1;
        }
        self.valid = false;
        Ok(())
    }
}

impl InternalIterator for LevelIter {
    fn first(&mut self) -> Result<()> {
        self.forward_from(0, |t| t.first())
    }

    fn last(&mut self) -> Result<()> {
        if self.files.is_empty() {
            self.valid = false;
            return Ok(());
        }
        let last = self.files.len() - 1;
        self.backward_from(last, |t| t.last())
    }

    fn seek_ge(&mut self, user_key: &[u8]) -> Result<()> {
        let cmp = self.cmp;
        // First file that could hold a key >= target.
        let idx = self.files.partition_point(|f| {
            match cmp.cmp(&f.largest.user_key, user_key) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => f.largest_is_exclusive(),
                std::cmp::Ordering::Greater => false,
            }
        });
        let key = user_key.to_vec();
        self.forward_from(idx, move |t| t.seek_ge(&key))
    }

    fn seek_lt(&mut self, user_key: &[u8]) -> Result<()> {
        let cmp = self.cmp;
        // Files at or past this index hold only keys >= target.
        let idx = self.files.partition_point(|f| {
            cmp.cmp(&f.smallest.user_key, user_key) == std::cmp::Ordering::Less
        });
        if idx == 0 {
            self.valid = false;
            return Ok(());
        }
        let key = user_key.to_vec();
        self.backward_from(idx - 1, move |t| t.seek_lt(&key))
    }

    fn next(&mut self) -> Result<()> {
        assert!(self.valid, "next on invalid iterator");
        let table = self.table.as_mut().expect("valid iterator has a table");
        table.next()?;
        if table.valid() {
            return Ok(());
        }
        self.forward_from(self.file_idx + 1, |t| t.first())
    }

    fn prev(&mut self) -> Result<()> {
        assert!(self.valid, "prev on invalid iterator");
        let table = self.table.as_mut().expect("valid iterator has a table");
        table.prev()?;
        if table.valid() {
            return Ok(());
        }
        if self.file_idx == 0 {
            self.valid = false;
            return Ok(());
        }
        self.backward_from(self.file_idx - 1, |t| t.last())
    }

    fn valid(&self) -> bool {
        self.valid
    }

    fn key(&self) -> &InternalKey {
        self.table.as_ref().expect("valid iterator has a table").key()
    }

    fn value(&self) -> &[u8] {
        self.table.as_ref().expect("valid iterator has a table").value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BYTEWISE;
    use crate::key::KeyKind;
    use crate::sstable::{sst_path, TableWriter};
    use crate::tmpfs::TempDir;

    fn write_file(dir: &TempDir, num: u64, keys: &[(&[u8], &[u8])]) -> Arc<FileMetadata> {
        let path = sst_path(dir.path(), num);
        let mut w = TableWriter::new(&BYTEWISE, &path).unwrap();
        for (k, v) in keys {
            w.add(&InternalKey::new(*k, 1, KeyKind::Set), v).unwrap();
        }
        let props = w.finish().unwrap();
        Arc::new(FileMetadata {
            num,
            size: std::fs::metadata(&path).unwrap().len(),
            smallest: props.smallest(&BYTEWISE).unwrap(),
            largest: props.largest(&BYTEWISE).unwrap(),
            smallest_point: props.smallest_point.clone(),
            largest_point: props.largest_point.clone(),
            smallest_range: None,
            largest_range: None,
            smallest_seq: props.smallest_seq,
            largest_seq: props.largest_seq,
            creation_level: 1,
            virtual_bounds: None,
            seq_override: None,
        })
    }

    fn level(dir: &TempDir) -> LevelIter {
        let files = vec![
            write_file(dir, 1, &[(b"a", b"1"), (b"c", b"3")]),
            write_file(dir, 2, &[(b"f", b"6"), (b"h", b"8")]),
            write_file(dir, 3, &[(b"m", b"13"), (b"p", b"16")]),
        ];
        LevelIter::new(&BYTEWISE, dir.path().to_path_buf(), files)
    }

    #[test]
    fn walks_files_in_order() {
        let dir = TempDir::new().unwrap();
        let mut iter = level(&dir);

        let mut keys = Vec::new();
        iter.first().unwrap();
        while iter.valid() {
            keys.push(iter.key().user_key.clone());
            iter.next().unwrap();
        }
        let want: Vec<Vec<u8>> = [b"a", b"c", b"f", b"h", b"m", b"p"]
            .iter()
            .map(|k| k.to_vec())
            .collect();
        assert_eq!(keys, want);
    }

    #[test]
    fn seeks_into_the_right_file() {
        let dir = TempDir::new().unwrap();
        let mut iter = level(&dir);

        iter.seek_ge(b"g").unwrap();
        assert_eq!(iter.key().user_key, b"h");
        // Between files: lands on the next file's first key.
        iter.seek_ge(b"i").unwrap();
        assert_eq!(iter.key().user_key, b"m");
        iter.seek_ge(b"q").unwrap();
        assert!(!iter.valid());

        iter.seek_lt(b"f").unwrap();
        assert_eq!(iter.key().user_key, b"c");
        iter.seek_lt(b"a").unwrap();
        assert!(!iter.valid());
        iter.seek_lt(b"zz").unwrap();
        assert_eq!(iter.key().user_key, b"p");
    }

    #[test]
    fn steps_across_file_boundaries_backward() {
        let dir = TempDir::new().unwrap();
        let mut iter = level(&dir);

        iter.last().unwrap();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().user_key.clone());
            iter.prev().unwrap();
        }
        let want: Vec<Vec<u8>> = [b"p", b"m", b"h", b"f", b"c", b"a"]
            .iter()
            .map(|k| k.to_vec())
            .collect();
        assert_eq!(keys, want);
    }

    #[test]
    fn empty_level_is_always_invalid() {
        let dir = TempDir::new().unwrap();
        let mut iter = LevelIter::new(&BYTEWISE, dir.path().to_path_buf(), Vec::new());
        iter.first().unwrap();
        assert!(!iter.valid());
        iter.seek_ge(b"a").unwrap();
        assert!(!iter.valid());
        iter.seek_lt(b"z").unwrap();
        assert!(!iter.valid());
    }
}
