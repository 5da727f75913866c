//! The manifest: an append-only log of version edits, plus the marker
//! files that name the live manifest and the active format version.
//!
//! Record framing matches the WAL: `[len: u32][edit][crc32: u32]`,
//! big-endian, CRC32 (ISCSI). Installation is atomic: the edit is appended
//! and fsynced, then the `marker.manifest.<seq>.<target>` file is moved to
//! point at the manifest. Opening reads the highest-sequence marker and
//! replays the manifest it names.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::edit::VersionEdit;
use crate::errcorrupt;
use crate::error::Result;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const MANIFEST_MARKER: &str = "manifest";
pub const FORMAT_MARKER: &str = "format-version";

pub fn manifest_path(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{num:06}"))
}

/// An open manifest accepting appended edits.
pub struct Manifest {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    num: u64,
}

impl Manifest {
    pub fn create(dir: &Path, num: u64) -> Result<Self> {
        let path = manifest_path(dir, num);
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let writer = BufWriter::new(file.try_clone()?);
        Ok(Self {
            file,
            writer,
            path,
            num,
        })
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one edit and fsyncs. The edit is durable when this returns.
    pub fn append(&mut self, edit: &VersionEdit) -> Result<()> {
        let payload = edit.encode();
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(&payload)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        self.writer.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Replays every durable edit of a manifest. A torn final frame is treated
/// as the crash tail; a checksum mismatch on a complete frame is
/// corruption.
pub fn replay(path: &Path) -> Result<Vec<VersionEdit>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut edits = Vec::new();
    let mut offset = 0u64;
    loop {
        if offset + 8 > size {
            break;
        }
        let mut header = [0u8; 4];
        file.read_exact_at(&mut header, offset)?;
        let len = u64::from(u32::from_be_bytes(header));
        if offset + 8 + len > size {
            // Torn tail.
            break;
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact_at(&mut payload, offset + 4)?;
        let mut crc_buf = [0u8; 4];
        file.read_exact_at(&mut crc_buf, offset + 4 + len)?;
        if u32::from_be_bytes(crc_buf) != CRC32.checksum(&payload) {
            return errcorrupt!(
                "manifest {} record at offset {offset} failed checksum",
                path.display()
            );
        }
        edits.push(VersionEdit::decode(&payload)?);
        offset += 8 + len;
    }
    Ok(edits)
}

fn marker_prefix(name: &str) -> String {
    format!("marker.{name}.")
}

/// Reads the current `(seq, target)` of the named marker, if present.
pub fn read_marker(dir: &Path, name: &str) -> Result<Option<(u64, String)>> {
    let prefix = marker_prefix(name);
    let mut best: Option<(u64, String)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(rest) = file_name.strip_prefix(&prefix) else {
            continue;
        };
        let Some((seq_str, target)) = rest.split_once('.') else {
            continue;
        };
        let Ok(seq) = seq_str.parse::<u64>() else {
            continue;
        };
        if best.as_ref().map(|(s, _)| seq > *s).unwrap_or(true) {
            best = Some((seq, target.to_string()));
        }
    }
    Ok(best)
}

/// Atomically points the named marker at `target`: the successor marker
/// file is created and synced before every older marker is removed.
pub fn move_marker(dir: &Path, name: &str, target: &str) -> Result<()> {
    let next_seq = read_marker(dir, name)?.map(|(seq, _)| seq + 1).unwrap_or(1);
    let marker = dir.join(format!("marker.{name}.{next_seq:06}.{target}"));
    File::create(&marker)?.sync_all()?;
    sync_dir(dir)?;

    let prefix = marker_prefix(name);
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(&prefix) && entry.path() != marker {
            fs::remove_file(entry.path())?;
        }
    }
    sync_dir(dir)
}

/// Fsyncs a directory so renames and creations within it are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn append_replay_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::create(dir.path(), 1).unwrap();

        let e1 = VersionEdit {
            comparator_name: Some("cinder.bytewise".into()),
            next_file_num: Some(5),
            ..VersionEdit::default()
        };
        let e2 = VersionEdit {
            last_seq: Some(42),
            min_unflushed_log_num: Some(3),
            ..VersionEdit::default()
        };
        manifest.append(&e1).unwrap();
        manifest.append(&e2).unwrap();

        let edits = replay(&manifest_path(dir.path(), 1)).unwrap();
        assert_eq!(edits, vec![e1, e2]);
    }

    #[test]
    fn replay_tolerates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::create(dir.path(), 2).unwrap();
        manifest
            .append(&VersionEdit {
                last_seq: Some(1),
                ..VersionEdit::default()
            })
            .unwrap();
        drop(manifest);

        let path = manifest_path(dir.path(), 2);
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0, 0, 0, 50, 1, 2, 3]);
        fs::write(&path, bytes).unwrap();

        let edits = replay(&path).unwrap();
        assert_eq!(edits.len(), 1);
    }

    #[test]
    fn replay_rejects_mid_file_corruption() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::create(dir.path(), 3).unwrap();
        manifest
            .append(&VersionEdit {
                last_seq: Some(1),
                ..VersionEdit::default()
            })
            .unwrap();
        drop(manifest);

        let path = manifest_path(dir.path(), 3);
        let mut bytes = fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 6] ^= 0x01; // flip a payload bit, leaving the frame whole
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            replay(&path),
            Err(crate::Error::Corruption(_))
        ));
    }

    #[test]
    fn markers_move_atomically() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_marker(dir.path(), MANIFEST_MARKER).unwrap(), None);

        move_marker(dir.path(), MANIFEST_MARKER, "MANIFEST-000001").unwrap();
        assert_eq!(
            read_marker(dir.path(), MANIFEST_MARKER).unwrap(),
            Some((1, "MANIFEST-000001".to_string()))
        );

        move_marker(dir.path(), MANIFEST_MARKER, "MANIFEST-000002").unwrap();
        assert_eq!(
            read_marker(dir.path(), MANIFEST_MARKER).unwrap(),
            Some((2, "MANIFEST-000002".to_string()))
        );

        // Exactly one manifest marker file remains.
        let count = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("marker.manifest.")
            })
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn format_marker_is_independent() {
        let dir = TempDir::new().unwrap();
        move_marker(dir.path(), FORMAT_MARKER, "1").unwrap();
        move_marker(dir.path(), MANIFEST_MARKER, "MANIFEST-000001").unwrap();
        assert_eq!(
            read_marker(dir.path(), FORMAT_MARKER).unwrap(),
            Some((1, "1".to_string()))
        );
    }
}
