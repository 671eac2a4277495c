//! The durable-storage collaborator.
//!
//! The state machine never writes to storage. It reads persisted entries,
//! terms and snapshots through [`Storage`], and describes what must be
//! written through the [`Ready`](crate::Ready) batch; the driver performs
//! the writes and then acknowledges them.
//!
//! [`MemoryStorage`] is a complete in-memory implementation used by tests
//! and by drivers that keep their log in memory.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;

use crate::error::{StorageError, StorageResult};
use crate::message::{limit_size, ConfState, Entry, HardState, Snapshot};

/// Persisted state recovered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RaftState {
    /// Last persisted term, vote and commit.
    pub hard_state: HardState,
    /// Last persisted membership.
    pub conf_state: ConfState,
}

/// Read access to the durable log.
///
/// Implementations must return entries and terms that have been made
/// durable; anything still in flight belongs to the unstable log.
pub trait Storage {
    /// Returns the persisted hard state and membership.
    ///
    /// # Errors
    /// Returns an error if the state cannot be read.
    fn initial_state(&self) -> StorageResult<RaftState>;

    /// Returns entries in `[lo, hi)`, truncated to `max_size` bytes but
    /// always containing at least one entry if any exist in the range.
    ///
    /// # Errors
    /// `Compacted` if `lo` precedes the first available index,
    /// `Unavailable` if the range extends past the last index.
    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> StorageResult<Vec<Entry>>;

    /// Returns the term of the entry at `index`. The index just before the
    /// first available entry is answered from the snapshot metadata.
    ///
    /// # Errors
    /// `Compacted` if `index` is older than that, `Unavailable` if newer
    /// than the last index.
    fn term(&self, index: u64) -> StorageResult<u64>;

    /// Returns the index of the first available entry.
    ///
    /// # Errors
    /// Returns an error if the index cannot be determined.
    fn first_index(&self) -> StorageResult<u64>;

    /// Returns the index of the last entry.
    ///
    /// # Errors
    /// Returns an error if the index cannot be determined.
    fn last_index(&self) -> StorageResult<u64>;

    /// Returns the most recent snapshot.
    ///
    /// # Errors
    /// `SnapshotTemporarilyUnavailable` if a snapshot is being prepared;
    /// the caller retries later.
    fn snapshot(&self) -> StorageResult<Snapshot>;
}

/// State behind a [`MemoryStorage`] handle.
#[derive(Debug)]
pub struct MemoryStorageCore {
    hard_state: HardState,
    snapshot: Snapshot,
    // entries[0] is a dummy carrying the snapshot's (index, term).
    entries: Vec<Entry>,
    snapshot_unavailable: bool,
}

impl Default for MemoryStorageCore {
    fn default() -> Self {
        Self {
            hard_state: HardState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
            snapshot_unavailable: false,
        }
    }
}

impl MemoryStorageCore {
    fn offset(&self) -> u64 {
        self.entries[0].index
    }

    fn first_index(&self) -> u64 {
        self.offset() + 1
    }

    fn last_index(&self) -> u64 {
        self.offset() + self.entries.len() as u64 - 1
    }

    /// Persists the hard state.
    pub fn set_hard_state(&mut self, hs: HardState) {
        self.hard_state = hs;
    }

    /// Returns the persisted hard state.
    #[must_use]
    pub const fn hard_state(&self) -> &HardState {
        &self.hard_state
    }

    /// Persists the membership without changing the log.
    pub fn set_conf_state(&mut self, cs: ConfState) {
        self.snapshot.metadata.conf_state = cs;
    }

    /// Replaces the whole log with `snapshot`.
    ///
    /// # Errors
    /// `SnapshotOutOfDate` if it is not newer than the current snapshot.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> StorageResult<()> {
        let index = snapshot.metadata.index;
        if index <= self.snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }

        self.entries = vec![Entry {
            term: snapshot.metadata.term,
            index,
            ..Entry::default()
        }];
        self.snapshot = snapshot;
        Ok(())
    }

    /// Records a snapshot of the state machine as of `index`.
    ///
    /// # Errors
    /// `SnapshotOutOfDate` if `index` is not newer than the current
    /// snapshot, `Unavailable` if it is past the last entry.
    pub fn create_snapshot(
        &mut self,
        index: u64,
        conf_state: Option<ConfState>,
        data: Bytes,
    ) -> StorageResult<Snapshot> {
        if index <= self.snapshot.metadata.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        if index > self.last_index() {
            return Err(StorageError::Unavailable);
        }

        let offset = self.offset();
        self.snapshot.metadata.index = index;
        self.snapshot.metadata.term = self.entries[(index - offset) as usize].term;
        if let Some(cs) = conf_state {
            self.snapshot.metadata.conf_state = cs;
        }
        self.snapshot.data = data;
        Ok(self.snapshot.clone())
    }

    /// Discards entries before `compact_index`.
    ///
    /// # Errors
    /// `Compacted` if already compacted past it, `Unavailable` if it is
    /// beyond the last entry.
    pub fn compact(&mut self, compact_index: u64) -> StorageResult<()> {
        let offset = self.offset();
        if compact_index <= offset {
            return Err(StorageError::Compacted);
        }
        if compact_index > self.last_index() {
            return Err(StorageError::Unavailable);
        }

        let i = (compact_index - offset) as usize;
        let dummy = Entry {
            term: self.entries[i].term,
            index: self.entries[i].index,
            ..Entry::default()
        };
        self.entries.drain(..=i);
        self.entries.insert(0, dummy);
        Ok(())
    }

    /// Appends entries, replacing any conflicting suffix.
    ///
    /// # Panics
    /// Panics if the entries would leave a gap after the last index.
    pub fn append(&mut self, entries: &[Entry]) {
        let Some(head) = entries.first() else {
            return;
        };

        let first = self.first_index();
        let last = head.index + entries.len() as u64 - 1;
        if last < first {
            // Everything is already compacted.
            return;
        }

        // Skip the compacted prefix.
        let entries = if first > head.index {
            &entries[(first - head.index) as usize..]
        } else {
            entries
        };

        let offset = (entries[0].index - self.offset()) as usize;
        assert!(
            offset <= self.entries.len(),
            "missing log entry [last: {}, append at: {}]",
            self.last_index(),
            entries[0].index
        );
        self.entries.truncate(offset);
        self.entries.extend_from_slice(entries);
    }

    /// Makes the next `snapshot()` calls fail as temporarily unavailable.
    pub fn set_snapshot_unavailable(&mut self, unavailable: bool) {
        self.snapshot_unavailable = unavailable;
    }
}

/// Thread-safe in-memory storage.
///
/// Cloning yields another handle to the same log, so a driver can keep
/// writing to the storage it handed to the state machine.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    core: Arc<RwLock<MemoryStorageCore>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage whose membership is `conf_state`.
    #[must_use]
    pub fn new_with_conf_state(conf_state: ConfState) -> Self {
        let store = Self::new();
        store.wl().set_conf_state(conf_state);
        store
    }

    /// Acquires the read lock.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn rl(&self) -> RwLockReadGuard<'_, MemoryStorageCore> {
        self.core.read().expect("lock poisoned")
    }

    /// Acquires the write lock.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn wl(&self) -> RwLockWriteGuard<'_, MemoryStorageCore> {
        self.core.write().expect("lock poisoned")
    }
}

impl Storage for MemoryStorage {
    fn initial_state(&self) -> StorageResult<RaftState> {
        let core = self.rl();
        Ok(RaftState {
            hard_state: core.hard_state,
            conf_state: core.snapshot.metadata.conf_state.clone(),
        })
    }

    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> StorageResult<Vec<Entry>> {
        let core = self.rl();
        let offset = core.offset();
        if lo <= offset {
            return Err(StorageError::Compacted);
        }
        if hi > core.last_index() + 1 || core.entries.len() == 1 {
            return Err(StorageError::Unavailable);
        }

        let (lo, hi) = ((lo - offset) as usize, (hi - offset) as usize);
        let mut entries = core.entries[lo..hi].to_vec();
        limit_size(&mut entries, max_size);
        Ok(entries)
    }

    fn term(&self, index: u64) -> StorageResult<u64> {
        let core = self.rl();
        let offset = core.offset();
        if index < offset {
            return Err(StorageError::Compacted);
        }
        core.entries
            .get((index - offset) as usize)
            .map(|e| e.term)
            .ok_or(StorageError::Unavailable)
    }

    fn first_index(&self) -> StorageResult<u64> {
        Ok(self.rl().first_index())
    }

    fn last_index(&self) -> StorageResult<u64> {
        Ok(self.rl().last_index())
    }

    fn snapshot(&self) -> StorageResult<Snapshot> {
        let core = self.rl();
        if core.snapshot_unavailable {
            return Err(StorageError::SnapshotTemporarilyUnavailable);
        }
        Ok(core.snapshot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(index: u64, term: u64) -> Entry {
        Entry::new(term, index, Bytes::new())
    }

    fn make_storage(ents: &[(u64, u64)]) -> MemoryStorage {
        let store = MemoryStorage::new();
        {
            let mut core = store.wl();
            core.entries = ents.iter().map(|&(i, t)| make_entry(i, t)).collect();
        }
        store
    }

    #[test]
    fn test_storage_term() {
        let store = make_storage(&[(3, 3), (4, 4), (5, 5)]);
        assert_eq!(store.term(2), Err(StorageError::Compacted));
        assert_eq!(store.term(3), Ok(3));
        assert_eq!(store.term(5), Ok(5));
        assert_eq!(store.term(6), Err(StorageError::Unavailable));
    }

    #[test]
    fn test_storage_entries() {
        let store = make_storage(&[(3, 3), (4, 4), (5, 5), (6, 6)]);
        assert_eq!(store.entries(2, 6, u64::MAX), Err(StorageError::Compacted));
        assert_eq!(store.entries(3, 4, u64::MAX), Err(StorageError::Compacted));
        assert_eq!(store.entries(4, 5, u64::MAX), Ok(vec![make_entry(4, 4)]));
        assert_eq!(
            store.entries(4, 7, u64::MAX),
            Ok(vec![make_entry(4, 4), make_entry(5, 5), make_entry(6, 6)])
        );
        assert_eq!(
            store.entries(4, 8, u64::MAX),
            Err(StorageError::Unavailable)
        );
        // At least one entry even with a zero budget.
        assert_eq!(store.entries(4, 7, 0), Ok(vec![make_entry(4, 4)]));
        let two = make_entry(4, 4).size() * 2;
        assert_eq!(store.entries(4, 7, two).unwrap().len(), 2);
    }

    #[test]
    fn test_storage_first_last_index() {
        let store = make_storage(&[(3, 3), (4, 4), (5, 5)]);
        assert_eq!(store.first_index(), Ok(4));
        assert_eq!(store.last_index(), Ok(5));
        store.wl().append(&[make_entry(6, 5)]);
        assert_eq!(store.last_index(), Ok(6));
    }

    #[test]
    fn test_storage_compact() {
        let store = make_storage(&[(3, 3), (4, 4), (5, 5)]);
        assert_eq!(store.wl().compact(2), Err(StorageError::Compacted));
        assert_eq!(store.wl().compact(3), Err(StorageError::Compacted));
        assert_eq!(store.wl().compact(4), Ok(()));
        assert_eq!(store.first_index(), Ok(5));
        assert_eq!(store.term(4), Ok(4));
        assert_eq!(store.wl().compact(6), Err(StorageError::Unavailable));
    }

    #[test]
    fn test_storage_append() {
        let store = make_storage(&[(3, 3), (4, 4), (5, 5)]);
        // Overwrite with a conflicting suffix.
        store.wl().append(&[make_entry(4, 6), make_entry(5, 6)]);
        assert_eq!(store.term(4), Ok(6));
        assert_eq!(store.last_index(), Ok(5));

        // Truncate the compacted prefix of the incoming entries.
        store
            .wl()
            .append(&[make_entry(2, 3), make_entry(3, 3), make_entry(4, 5)]);
        assert_eq!(store.term(4), Ok(5));
        assert_eq!(store.last_index(), Ok(4));

        // Entirely compacted: ignored.
        store.wl().append(&[make_entry(1, 1)]);
        assert_eq!(store.last_index(), Ok(4));
    }

    #[test]
    #[should_panic(expected = "missing log entry")]
    fn test_storage_append_gap_panics() {
        let store = make_storage(&[(3, 3), (4, 4)]);
        store.wl().append(&[make_entry(6, 4)]);
    }

    #[test]
    fn test_storage_snapshots() {
        let store = make_storage(&[(3, 3), (4, 4), (5, 5)]);
        let cs = ConfState::with_voters([1, 2, 3]);
        let snap = store
            .wl()
            .create_snapshot(4, Some(cs.clone()), Bytes::from_static(b"data"))
            .unwrap();
        assert_eq!(snap.metadata.index, 4);
        assert_eq!(snap.metadata.term, 4);
        assert_eq!(snap.metadata.conf_state, cs);
        assert_eq!(
            store.wl().create_snapshot(3, None, Bytes::new()),
            Err(StorageError::SnapshotOutOfDate)
        );

        let fresh = MemoryStorage::new();
        fresh.wl().apply_snapshot(snap.clone()).unwrap();
        assert_eq!(fresh.first_index(), Ok(5));
        assert_eq!(fresh.last_index(), Ok(4));
        assert_eq!(fresh.term(4), Ok(4));
        assert_eq!(fresh.initial_state().unwrap().conf_state, cs);
        assert_eq!(
            fresh.wl().apply_snapshot(snap),
            Err(StorageError::SnapshotOutOfDate)
        );

        fresh.wl().set_snapshot_unavailable(true);
        assert_eq!(
            fresh.snapshot(),
            Err(StorageError::SnapshotTemporarilyUnavailable)
        );
    }
}
