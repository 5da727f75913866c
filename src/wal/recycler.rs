//! WAL segment recycling.
//!
//! Finalized log files below a size cap are queued for reuse instead of
//! being deleted, amortizing the directory-metadata fsync of creating a
//! fresh file. The queue is FIFO: segments are reused oldest-first, and a
//! segment may only be removed from the head.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::errinput;
use crate::error::Result;

/// A finalized log segment available for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub num: u64,
    pub size: u64,
}

#[derive(Default)]
struct Inner {
    logs: VecDeque<FileInfo>,
    /// Highest file number ever offered, including rejected overflow.
    max_log_num: u64,
}

pub struct LogRecycler {
    /// Maximum queued segments.
    limit: usize,
    /// Segments numbered below this predate the recycler and are never
    /// reused.
    min_recycle_num: u64,
    inner: Mutex<Inner>,
}

impl LogRecycler {
    pub fn new(limit: usize, min_recycle_num: u64) -> Self {
        Self {
            limit,
            min_recycle_num,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Offers a finalized segment for reuse. Returns true when the caller
    /// must keep the file on disk (queued now, or already considered
    /// earlier); false means the caller should delete it.
    pub fn add(&self, info: FileInfo) -> bool {
        if info.num < self.min_recycle_num {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        if info.num <= inner.max_log_num {
            // Already considered; idempotent success.
            return true;
        }
        inner.max_log_num = info.num;
        if inner.logs.len() >= self.limit {
            return false;
        }
        inner.logs.push_back(info);
        true
    }

    /// The oldest reusable segment, if any.
    pub fn peek(&self) -> Option<FileInfo> {
        self.inner.lock().unwrap().logs.front().copied()
    }

    /// Removes the head of the queue. `num` must name the head.
    pub fn pop(&self, num: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.logs.front() {
            None => errinput!("pop {num:06} from empty recycler"),
            Some(head) if head.num != num => {
                let queued: Vec<u64> = inner.logs.iter().map(|f| f.num).collect();
                errinput!("pop invalid {num:06} vs {queued:06?}")
            }
            Some(_) => {
                inner.logs.pop_front();
                Ok(())
            }
        }
    }

    /// Highest file number ever offered.
    pub fn max_log_num(&self) -> u64 {
        self.inner.lock().unwrap().max_log_num
    }

    pub fn queued(&self) -> Vec<u64> {
        self.inner.lock().unwrap().logs.iter().map(|f| f.num).collect()
    }
}
