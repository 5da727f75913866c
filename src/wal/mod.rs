//! Write-ahead log.
//!
//! One WAL segment pairs with one memtable; rotating the memtable rotates
//! the log. Each record frames one encoded batch:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | batch payload    |crc32:u32  |
//! +-----------+------------------+-----------+
//! ```
//!
//! Big-endian integers, CRC32 (ISCSI) over the payload. Recovery replays
//! records until the first torn or damaged frame, which is treated as the
//! crash tail.

pub mod recycler;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// An append-only WAL segment.
pub struct Wal {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
    num: u64,
    size: u64,
}

impl Wal {
    /// Creates (or truncates, when reusing a recycled file) the segment.
    pub fn create(path: impl Into<PathBuf>, num: u64) -> Result<Self> {
        let path = path.into();
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
            size: 0,
        })
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends one framed record. Durable only after [`Wal::sync`].
    pub fn append(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_u32::<BigEndian>(payload.len() as u32)?;
        self.writer.write_all(payload)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(payload))?;
        self.size += 8 + payload.len() as u64;
        Ok(())
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flushes buffered records to the OS without fsync.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("num", &self.num)
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

/// Replays the records of a finalized or crash-tail segment.
pub fn replay(path: &Path) -> Result<WalReplay> {
    let file = File::open(path)?;
    Ok(WalReplay {
        reader: BufReader::new(file),
        done: false,
    })
}

pub struct WalReplay {
    reader: BufReader<File>,
    done: bool,
}

impl WalReplay {
    fn read_record(&mut self) -> Option<Vec<u8>> {
        let len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(_) => return None,
        };
        let mut payload = vec![0u8; len];
        if self.reader.read_exact(&mut payload).is_err() {
            return None;
        }
        let crc = match self.reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(_) => return None,
        };
        if crc != CRC32.checksum(&payload) {
            tracing::warn!(len, "wal record failed checksum, treating as crash tail");
            return None;
        }
        Some(payload)
    }
}

impl Iterator for WalReplay {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Some(payload) => Some(payload),
            None => {
                self.done = true;
                None
            }
        }
    }
}

/// Formats the name of a WAL segment inside the database directory.
pub fn log_path(dir: &Path, num: u64) -> PathBuf {
    dir.join(format!("{num:06}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = log_path(dir.path(), 3);

        let mut wal = Wal::create(&path, 3).unwrap();
        wal.append(b"first").unwrap();
        wal.append(b"second").unwrap();
        wal.sync().unwrap();

        let records: Vec<_> = replay(&path).unwrap().collect();
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = log_path(dir.path(), 4);

        let mut wal = Wal::create(&path, 4).unwrap();
        wal.append(b"whole").unwrap();
        wal.sync().unwrap();

        // Simulate a torn write: a length prefix with no payload behind it.
        {
            use std::io::Write;
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0, 0, 0, 99, 1, 2]).unwrap();
        }

        let records: Vec<_> = replay(&path).unwrap().collect();
        assert_eq!(records, vec![b"whole".to_vec()]);
    }

    #[test]
    fn replay_stops_at_bad_checksum() {
        let dir = TempDir::new().unwrap();
        let path = log_path(dir.path(), 5);

        let mut wal = Wal::create(&path, 5).unwrap();
        wal.append(b"good").unwrap();
        wal.append(b"evil").unwrap();
        wal.sync().unwrap();

        // Flip a payload byte in the second record.
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 6] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let records: Vec<_> = replay(&path).unwrap().collect();
        assert_eq!(records, vec![b"good".to_vec()]);
    }

    #[test]
    fn create_truncates_recycled_file() {
        let dir = TempDir::new().unwrap();
        let path = log_path(dir.path(), 6);

        let mut wal = Wal::create(&path, 6).unwrap();
        wal.append(b"stale").unwrap();
        wal.sync().unwrap();
        drop(wal);

        let wal = Wal::create(&path, 9).unwrap();
        assert_eq!(wal.size(), 0);
        drop(wal);
        let records: Vec<_> = replay(&path).unwrap().collect();
        assert!(records.is_empty());
    }
}
