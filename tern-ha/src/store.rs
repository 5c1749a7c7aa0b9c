//! The commit-log collaborator interface.
//!
//! The storage engine lives outside this crate; replication only needs the
//! narrow surface below. Boolean returns mirror the store's contract: a
//! `false` append or truncate is a storage-level rejection, not an I/O
//! error, and the endpoint decides whether it is fatal for the connection.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// The commit-log surface consumed by the replication endpoints.
pub trait CommitLog: Send + Sync + 'static {
    /// One past the last byte of the log.
    fn max_phy_offset(&self) -> i64;

    /// First byte still retained by the log.
    fn min_phy_offset(&self) -> i64;

    /// Start offset of the newest log file, for `sync_from_last_file`.
    fn last_file_start_offset(&self) -> i64 {
        self.min_phy_offset()
    }

    /// Appends replicated bytes at exactly `offset`.
    ///
    /// Returns false if the store cannot append there.
    fn append_to_commit_log(&self, offset: i64, data: &[u8]) -> bool;

    /// Drops everything at and beyond `offset`.
    ///
    /// Returns false if the store cannot truncate.
    fn truncate_files(&self, offset: i64) -> bool;

    /// Reads up to `max_bytes` starting at `offset`, or `None` when the
    /// offset is outside the retained range.
    fn read_commit_log(&self, offset: i64, max_bytes: usize) -> Option<Bytes>;

    /// Runs the store's self check, dropping any torn tail write.
    ///
    /// Returns the new max offset if anything was dropped.
    fn truncate_dirty_tail(&self) -> Option<i64>;

    /// Wall-clock milliseconds, the store's notion of now.
    fn now_ms(&self) -> i64 {
        // Safe cast: milliseconds since 1970 fit in i64 for ~292M years.
        #[allow(clippy::cast_possible_wrap)]
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_millis() as i64,
            Err(_) => 0,
        }
    }
}

#[derive(Debug, Default)]
struct MemLog {
    base_offset: i64,
    data: Vec<u8>,
}

/// An in-memory commit log for tests and embedding.
///
/// Offsets are physical byte positions; `base_offset` moves only when the
/// prefix is pruned or an empty log accepts its first replicated append.
#[derive(Debug, Default)]
pub struct MemoryCommitLog {
    inner: Mutex<MemLog>,
}

impl MemoryCommitLog {
    /// Creates an empty log starting at offset zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends local writes at the tail (the master's put path).
    ///
    /// Returns the offset the bytes were placed at.
    pub fn put(&self, data: &[u8]) -> i64 {
        let mut inner = self.lock();
        let offset = inner.base_offset + inner.data.len() as i64;
        inner.data.extend_from_slice(data);
        offset
    }

    /// Drops the prefix below `offset`, as file-level retention would.
    pub fn prune_prefix(&self, offset: i64) {
        let mut inner = self.lock();
        let max = inner.base_offset + inner.data.len() as i64;
        let clamped = offset.clamp(inner.base_offset, max);
        let cut = usize::try_from(clamped - inner.base_offset).unwrap_or(0);
        inner.data.drain(..cut);
        inner.base_offset = clamped;
    }

    /// Returns a copy of the retained bytes, for assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemLog> {
        self.inner.lock().expect("memory commit log lock poisoned")
    }
}

impl CommitLog for MemoryCommitLog {
    fn max_phy_offset(&self) -> i64 {
        let inner = self.lock();
        inner.base_offset + inner.data.len() as i64
    }

    fn min_phy_offset(&self) -> i64 {
        self.lock().base_offset
    }

    fn append_to_commit_log(&self, offset: i64, data: &[u8]) -> bool {
        let mut inner = self.lock();
        if inner.data.is_empty() {
            // An empty log accepts its first replicated bytes anywhere.
            inner.base_offset = offset;
            inner.data.extend_from_slice(data);
            return true;
        }

        let max = inner.base_offset + inner.data.len() as i64;
        if offset != max {
            return false;
        }
        inner.data.extend_from_slice(data);
        true
    }

    fn truncate_files(&self, offset: i64) -> bool {
        let mut inner = self.lock();
        let max = inner.base_offset + inner.data.len() as i64;
        if offset >= max {
            return true;
        }
        if offset <= inner.base_offset {
            inner.data.clear();
            inner.base_offset = offset.min(inner.base_offset);
            return true;
        }
        let keep = usize::try_from(offset - inner.base_offset).unwrap_or(0);
        inner.data.truncate(keep);
        true
    }

    fn read_commit_log(&self, offset: i64, max_bytes: usize) -> Option<Bytes> {
        let inner = self.lock();
        let max = inner.base_offset + inner.data.len() as i64;
        if offset < inner.base_offset || offset >= max {
            return None;
        }
        let start = usize::try_from(offset - inner.base_offset).ok()?;
        let end = inner.data.len().min(start + max_bytes);
        Some(Bytes::copy_from_slice(&inner.data[start..end]))
    }

    fn truncate_dirty_tail(&self) -> Option<i64> {
        // In-memory writes are never torn.
        None
    }
}
