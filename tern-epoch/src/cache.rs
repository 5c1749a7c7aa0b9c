//! In-memory epoch cache with consistent-point computation.
//!
//! Entries are ordered by epoch and by start offset; the end offset of an
//! entry is implicit (the next entry's start, or the tracked tail end for
//! the newest entry). Mutation is serialized behind a write lock and
//! mirrored to the epoch file when one is attached; reads take the shared
//! lock.

use std::sync::RwLock;

use tern_core::Epoch;
use tracing::{info, warn};

use crate::file::{EpochFile, EpochFileResult};

/// One master term in the log history.
///
/// The term owns the byte range `[start_offset, end_offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochEntry {
    /// The master term.
    pub epoch: Epoch,
    /// First offset written under this term.
    pub start_offset: i64,
    /// One past the last offset written under this term.
    pub end_offset: i64,
}

impl EpochEntry {
    /// Creates an entry covering `[start_offset, end_offset)`.
    #[must_use]
    pub const fn new(epoch: Epoch, start_offset: i64, end_offset: i64) -> Self {
        Self {
            epoch,
            start_offset,
            end_offset,
        }
    }

    /// Returns true if the entry's range contains `offset`.
    #[must_use]
    pub const fn contains(&self, offset: i64) -> bool {
        offset >= self.start_offset && offset < self.end_offset
    }
}

#[derive(Debug)]
struct Inner {
    /// `(epoch, start_offset)` records, strictly increasing in both fields.
    records: Vec<(Epoch, i64)>,
    /// End offset of the newest entry (the log tail).
    tail_end: i64,
    /// Durable mirror, absent for volatile caches.
    file: Option<EpochFile>,
}

impl Inner {
    fn end_of(&self, index: usize) -> i64 {
        match self.records.get(index + 1) {
            Some(&(_, next_start)) => next_start,
            None => self.tail_end.max(self.records[index].1),
        }
    }

    fn entry_at(&self, index: usize) -> EpochEntry {
        let (epoch, start) = self.records[index];
        EpochEntry::new(epoch, start, self.end_of(index))
    }

    fn persist(&self) -> EpochFileResult<()> {
        match &self.file {
            Some(file) => file.store(&self.records, self.tail_end),
            None => Ok(()),
        }
    }
}

/// The epoch history of one replica's commit log.
#[derive(Debug)]
pub struct EpochCache {
    inner: RwLock<Inner>,
}

impl EpochCache {
    /// Creates an empty volatile cache (no backing file).
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: Vec::new(),
                tail_end: 0,
                file: None,
            }),
        }
    }

    /// Opens a file-backed cache, recovering any persisted history.
    ///
    /// A missing file yields an empty cache; a corrupt file is an error.
    ///
    /// # Errors
    /// Returns an error on I/O failure or corruption.
    pub fn open(file: EpochFile) -> EpochFileResult<Self> {
        let (records, tail_end) = match file.load()? {
            Some(image) => {
                info!(
                    path = %file.path().display(),
                    entries = image.records.len(),
                    "Recovered epoch history"
                );
                (image.records, image.last_end_offset)
            }
            None => (Vec::new(), 0),
        };

        Ok(Self {
            inner: RwLock::new(Inner {
                records,
                tail_end,
                file: Some(file),
            }),
        })
    }

    /// Builds a volatile cache from received entries and a known tail end.
    ///
    /// Used to reconstruct the master's history from a handshake payload.
    #[must_use]
    pub fn from_entries(records: Vec<(Epoch, i64)>, last_end_offset: i64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                records,
                tail_end: last_end_offset,
                file: None,
            }),
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.read().records.len()
    }

    /// Returns true if the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Appends a new term starting at `start_offset`.
    ///
    /// The entry is rejected (returning `Ok(false)`) unless its epoch is
    /// strictly newer and its start offset no older than the current tail.
    ///
    /// # Errors
    /// Returns an error if persisting the mutation fails.
    pub fn append_entry(&self, epoch: Epoch, start_offset: i64) -> EpochFileResult<bool> {
        let mut inner = self.write();

        if let Some(&(last_epoch, last_start)) = inner.records.last() {
            if epoch <= last_epoch || start_offset < last_start {
                warn!(
                    %epoch,
                    start_offset,
                    %last_epoch,
                    last_start,
                    "Rejecting non-monotonic epoch entry"
                );
                return Ok(false);
            }
        }

        inner.records.push((epoch, start_offset));
        inner.tail_end = inner.tail_end.max(start_offset);
        inner.persist()?;
        Ok(true)
    }

    /// Updates the end offset of the newest entry (the log tail).
    ///
    /// Volatile: the value is persisted with the next structural mutation.
    pub fn set_last_end_offset(&self, end_offset: i64) {
        let mut inner = self.write();
        if !inner.records.is_empty() {
            inner.tail_end = end_offset;
        }
    }

    /// Returns the newest entry, if any.
    #[must_use]
    pub fn last_entry(&self) -> Option<EpochEntry> {
        let inner = self.read();
        if inner.records.is_empty() {
            None
        } else {
            Some(inner.entry_at(inner.records.len() - 1))
        }
    }

    /// Returns the newest epoch, if any.
    #[must_use]
    pub fn last_epoch(&self) -> Option<Epoch> {
        self.read().records.last().map(|&(epoch, _)| epoch)
    }

    /// Looks up the entry for the given epoch.
    #[must_use]
    pub fn entry_of(&self, epoch: Epoch) -> Option<EpochEntry> {
        let inner = self.read();
        let index = inner
            .records
            .binary_search_by_key(&epoch, |&(e, _)| e)
            .ok()?;
        Some(inner.entry_at(index))
    }

    /// Returns the entry whose range contains `offset`.
    #[must_use]
    pub fn entry_containing(&self, offset: i64) -> Option<EpochEntry> {
        let inner = self.read();
        // Last record whose start is <= offset.
        let index = inner
            .records
            .partition_point(|&(_, start)| start <= offset)
            .checked_sub(1)?;
        let entry = inner.entry_at(index);
        entry.contains(offset).then_some(entry)
    }

    /// Returns a snapshot of all entries, oldest first.
    #[must_use]
    pub fn all_entries(&self) -> Vec<EpochEntry> {
        let inner = self.read();
        (0..inner.records.len()).map(|i| inner.entry_at(i)).collect()
    }

    /// Finds the largest offset at which this log and `remote` are
    /// byte-identical.
    ///
    /// Walks both histories from newest to oldest looking for the greatest
    /// epoch present in both with the same start offset (same epoch with a
    /// different start means a different history). Returns `None` when no
    /// such epoch exists and the local log must be discarded wholesale.
    #[must_use]
    pub fn find_consistent_point(&self, remote: &Self) -> Option<i64> {
        let local = self.all_entries();
        for entry in local.iter().rev() {
            if let Some(remote_entry) = remote.entry_of(entry.epoch) {
                if remote_entry.start_offset == entry.start_offset {
                    return Some(entry.end_offset.min(remote_entry.end_offset));
                }
            }
        }
        None
    }

    /// Drops every entry beyond `offset` and clamps the tail to it.
    ///
    /// This is the slave-side truncation after a consistent point is found:
    /// entries strictly newer than the matching epoch belong to an
    /// overwritten history. Applying the same truncation twice is a no-op.
    ///
    /// # Errors
    /// Returns an error if persisting the mutation fails.
    pub fn truncate_suffix_from_offset(&self, offset: i64) -> EpochFileResult<()> {
        let mut inner = self.write();

        let keep = inner.records.partition_point(|&(_, start)| start < offset);
        let dropped = inner.records.len() - keep;
        inner.records.truncate(keep);
        inner.tail_end = inner.tail_end.min(offset);

        if dropped > 0 {
            info!(offset, dropped, "Truncated epoch suffix");
        }
        inner.persist()
    }

    /// Drops every entry entirely below `offset` and advances the
    /// containing entry's start, used when the commit log prunes old files.
    ///
    /// # Errors
    /// Returns an error if persisting the mutation fails.
    pub fn truncate_prefix_before_offset(&self, offset: i64) -> EpochFileResult<()> {
        let mut inner = self.write();

        let mut drop_count = 0;
        while drop_count < inner.records.len() && inner.end_of(drop_count) <= offset {
            drop_count += 1;
        }
        inner.records.drain(..drop_count);

        if let Some(first) = inner.records.first_mut() {
            if first.1 < offset {
                first.1 = offset;
            }
        }

        if drop_count > 0 {
            info!(offset, dropped = drop_count, "Truncated epoch prefix");
        }
        inner.persist()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("epoch cache lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("epoch cache lock poisoned")
    }
}

impl Default for EpochCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_of(records: &[(u32, i64)], tail_end: i64) -> EpochCache {
        EpochCache::from_entries(
            records
                .iter()
                .map(|&(e, s)| (Epoch::new(e), s))
                .collect(),
            tail_end,
        )
    }

    #[test]
    fn test_append_assigns_implicit_ends() {
        let cache = EpochCache::new();
        assert!(cache.append_entry(Epoch::new(1), 0).unwrap());
        assert!(cache.append_entry(Epoch::new(2), 1570).unwrap());
        cache.set_last_end_offset(3140);

        let entries = cache.all_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], EpochEntry::new(Epoch::new(1), 0, 1570));
        assert_eq!(entries[1], EpochEntry::new(Epoch::new(2), 1570, 3140));
    }

    #[test]
    fn test_append_rejects_stale_epoch() {
        let cache = EpochCache::new();
        assert!(cache.append_entry(Epoch::new(3), 100).unwrap());
        assert!(!cache.append_entry(Epoch::new(3), 200).unwrap());
        assert!(!cache.append_entry(Epoch::new(2), 300).unwrap());
        assert!(!cache.append_entry(Epoch::new(4), 50).unwrap());
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_entry_lookup() {
        let cache = cache_of(&[(1, 0), (2, 1570)], 3140);

        assert_eq!(
            cache.entry_of(Epoch::new(1)),
            Some(EpochEntry::new(Epoch::new(1), 0, 1570))
        );
        assert_eq!(cache.entry_of(Epoch::new(7)), None);

        assert_eq!(
            cache.entry_containing(0).map(|e| e.epoch),
            Some(Epoch::new(1))
        );
        assert_eq!(
            cache.entry_containing(1570).map(|e| e.epoch),
            Some(Epoch::new(2))
        );
        assert_eq!(cache.entry_containing(3140), None);
        assert_eq!(cache.entry_containing(-1), None);
    }

    #[test]
    fn test_consistent_point_shared_tail() {
        // Slave is one epoch behind but shares epoch 1 exactly.
        let master = cache_of(&[(1, 0), (2, 1570)], 3140);
        let slave = cache_of(&[(1, 0)], 1570);

        assert_eq!(slave.find_consistent_point(&master), Some(1570));
        assert_eq!(master.find_consistent_point(&slave), Some(1570));
    }

    #[test]
    fn test_consistent_point_divergent_suffix() {
        // Both share epoch 1; the slave wrote an epoch-2 suffix that the
        // new master's history (epoch 3) overwrote.
        let master = cache_of(&[(1, 0), (3, 1570)], 2400);
        let slave = cache_of(&[(1, 0), (2, 1570)], 2000);

        assert_eq!(slave.find_consistent_point(&master), Some(1570));
    }

    #[test]
    fn test_consistent_point_same_epoch_different_start() {
        // Same epoch number but a different start offset is a different
        // history, not a match.
        let master = cache_of(&[(1, 0), (2, 2000)], 3000);
        let slave = cache_of(&[(1, 0), (2, 1570)], 2500);

        assert_eq!(slave.find_consistent_point(&master), Some(1570));
    }

    #[test]
    fn test_consistent_point_none() {
        let master = cache_of(&[(4, 0)], 900);
        let slave = cache_of(&[(1, 0), (2, 300)], 600);

        assert_eq!(slave.find_consistent_point(&master), None);
    }

    #[test]
    fn test_consistent_point_caps_at_shorter_log() {
        // Same single epoch, slave has read less of it.
        let master = cache_of(&[(1, 0)], 3140);
        let slave = cache_of(&[(1, 0)], 1570);

        assert_eq!(slave.find_consistent_point(&master), Some(1570));
    }

    #[test]
    fn test_truncate_suffix() {
        let cache = cache_of(&[(1, 0), (2, 1570), (3, 3000)], 4200);
        cache.truncate_suffix_from_offset(1570).unwrap();

        let entries = cache.all_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], EpochEntry::new(Epoch::new(1), 0, 1570));
    }

    #[test]
    fn test_truncate_suffix_is_idempotent() {
        let cache = cache_of(&[(1, 0), (2, 1570), (3, 3000)], 4200);
        cache.truncate_suffix_from_offset(2000).unwrap();
        let once = cache.all_entries();

        cache.truncate_suffix_from_offset(2000).unwrap();
        assert_eq!(cache.all_entries(), once);

        // Epoch 2's range shrank to the truncation point.
        assert_eq!(once.last().unwrap().end_offset, 2000);
    }

    #[test]
    fn test_truncate_suffix_to_zero_empties_cache() {
        let cache = cache_of(&[(1, 0), (2, 1570)], 3000);
        cache.truncate_suffix_from_offset(0).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_truncate_prefix() {
        let cache = cache_of(&[(1, 0), (2, 1570), (3, 3000)], 4200);
        cache.truncate_prefix_before_offset(1570).unwrap();

        let entries = cache.all_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], EpochEntry::new(Epoch::new(2), 1570, 3000));

        // A cut inside an entry advances its start.
        cache.truncate_prefix_before_offset(2000).unwrap();
        assert_eq!(cache.all_entries()[0].start_offset, 2000);
    }

    #[test]
    fn test_file_backed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epochs");

        {
            let cache = EpochCache::open(EpochFile::new(&path)).unwrap();
            cache.append_entry(Epoch::new(1), 0).unwrap();
            cache.append_entry(Epoch::new(2), 1570).unwrap();
        }

        let recovered = EpochCache::open(EpochFile::new(&path)).unwrap();
        assert_eq!(recovered.entry_count(), 2);
        assert_eq!(recovered.last_epoch(), Some(Epoch::new(2)));
    }

    #[test]
    fn test_file_backed_truncation_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epochs");

        let cache = EpochCache::open(EpochFile::new(&path)).unwrap();
        cache.append_entry(Epoch::new(1), 0).unwrap();
        cache.append_entry(Epoch::new(2), 1570).unwrap();
        cache.truncate_suffix_from_offset(1570).unwrap();

        let recovered = EpochCache::open(EpochFile::new(&path)).unwrap();
        assert_eq!(recovered.entry_count(), 1);
        assert_eq!(recovered.last_epoch(), Some(Epoch::new(1)));
    }
}
