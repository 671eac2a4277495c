//! The replicated log: the durable prefix held by [`Storage`] followed by
//! the in-memory [`Unstable`] suffix.
//!
//! # Invariants
//!
//! - `applied <= applying <= committed <= last_index()`
//! - entries at or below `committed` are never overwritten

mod unstable;

pub use unstable::Unstable;

use std::fmt;

use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::message::{entries_size, limit_size, Entry, Snapshot};
use crate::storage::Storage;

/// Log state of one replica.
pub struct RaftLog<S: Storage> {
    /// Durable entries.
    pub store: S,
    /// Entries and snapshot not yet durable.
    pub unstable: Unstable,
    /// Highest index known to be committed on a quorum.
    pub committed: u64,
    /// Highest index handed to the application for applying.
    pub applying: u64,
    /// Highest index the application reported as applied.
    ///
    /// Invariant: `applied <= applying <= committed`.
    pub applied: u64,
    /// Byte budget for entries that are being applied but not yet acknowledged.
    max_applying_ents_size: u64,
    applying_ents_size: u64,
    /// Set when the budget is exhausted, or when more committed entries
    /// remain than were handed out.
    applying_ents_paused: bool,
}

impl<S: Storage> RaftLog<S> {
    /// Creates a log over `store` with the given apply budget.
    ///
    /// # Panics
    /// Panics if the storage cannot report its bounds.
    pub fn new(store: S, max_applying_ents_size: u64) -> Self {
        let first_index = must(store.first_index(), "first index");
        let last_index = must(store.last_index(), "last index");

        Self {
            store,
            unstable: Unstable::new(last_index + 1),
            // Everything durable before the first index was committed and
            // applied when it was snapshotted.
            committed: first_index - 1,
            applying: first_index - 1,
            applied: first_index - 1,
            max_applying_ents_size,
            applying_ents_size: 0,
            applying_ents_paused: false,
        }
    }

    /// Byte budget for entries being applied.
    #[must_use]
    pub const fn max_applying_ents_size(&self) -> u64 {
        self.max_applying_ents_size
    }

    /// Appends entries from the leader if the log matches at
    /// `(index, log_term)`, and advances the commit index to
    /// `min(committed, last new index)`.
    ///
    /// Returns the index of the last new entry, or `None` if the log does
    /// not match.
    ///
    /// # Panics
    /// Panics if the entries conflict with a committed entry.
    pub fn maybe_append(
        &mut self,
        index: u64,
        log_term: u64,
        committed: u64,
        entries: &[Entry],
    ) -> Option<u64> {
        if !self.match_term(index, log_term) {
            return None;
        }

        let last_new_index = index + entries.len() as u64;
        let conflict = self.find_conflict(entries);
        if conflict != 0 {
            assert!(
                conflict > self.committed,
                "entry {conflict} conflict with committed entry [committed({})]",
                self.committed
            );
            let start = (conflict - (index + 1)) as usize;
            self.append(&entries[start..]);
        }
        self.commit_to(committed.min(last_new_index));
        Some(last_new_index)
    }

    /// Appends entries to the unstable log and returns the new last index.
    ///
    /// # Panics
    /// Panics if the entries would overwrite committed ones.
    pub fn append(&mut self, entries: &[Entry]) -> u64 {
        let Some(first) = entries.first() else {
            return self.last_index();
        };
        let after = first.index - 1;
        assert!(
            after >= self.committed,
            "after({after}) is out of range [committed({})]",
            self.committed
        );
        self.unstable.truncate_and_append(entries);
        self.last_index()
    }

    /// Returns the index of the first entry that does not match the log, or
    /// 0 if every entry matches (existing or not, entries beyond the log
    /// count as conflicting).
    #[must_use]
    pub fn find_conflict(&self, entries: &[Entry]) -> u64 {
        for e in entries {
            if !self.match_term(e.index, e.term) {
                if e.index <= self.last_index() {
                    info!(
                        index = e.index,
                        existing_term = self.zero_term_on_out_of_bounds(self.term(e.index)),
                        conflicting_term = e.term,
                        "found conflict"
                    );
                }
                return e.index;
            }
        }
        0
    }

    /// Returns the last position at or below `index` whose term is at most
    /// `term`, as `(index, term)`.
    ///
    /// Used to pick the next probe after a rejected append so that each
    /// probe skips a whole term of divergent entries rather than one
    /// index. If the term at some position cannot be read (compacted), that
    /// position is returned with term 0.
    #[must_use]
    pub fn find_conflict_by_term(&self, mut index: u64, term: u64) -> (u64, u64) {
        while index > 0 {
            match self.term(index) {
                Err(_) => return (index, 0),
                Ok(our_term) if our_term <= term => return (index, our_term),
                Ok(_) => index -= 1,
            }
        }
        (0, 0)
    }

    /// Unstable entries not yet handed out for persistence.
    #[must_use]
    pub fn next_unstable_ents(&self) -> &[Entry] {
        self.unstable.next_entries()
    }

    /// Returns true if unstable entries are waiting to be handed out.
    #[must_use]
    pub fn has_next_unstable_ents(&self) -> bool {
        !self.next_unstable_ents().is_empty()
    }

    /// Returns true if any unstable entries exist, handed out or not.
    #[must_use]
    pub fn has_next_or_in_progress_unstable_ents(&self) -> bool {
        !self.unstable.entries.is_empty()
    }

    /// Committed entries that may be handed to the application.
    ///
    /// With `allow_unstable` false, entries not yet durable locally are
    /// held back.
    ///
    /// # Panics
    /// Panics if committed entries cannot be read from storage.
    #[must_use]
    pub fn next_committed_ents(&self, allow_unstable: bool) -> Vec<Entry> {
        if self.applying_ents_paused || self.has_next_or_in_progress_snapshot() {
            return Vec::new();
        }
        let lo = self.applying + 1;
        let hi = self.max_appliable_index(allow_unstable) + 1;
        if lo >= hi {
            return Vec::new();
        }

        let max_size = self.max_applying_ents_size - self.applying_ents_size;
        assert!(
            max_size > 0,
            "applying entry size ({}-{})={max_size} not positive",
            self.max_applying_ents_size,
            self.applying_ents_size
        );
        match self.slice(lo, hi, max_size) {
            Ok(entries) => entries,
            Err(e) => panic!("unexpected error when getting unapplied entries ({e})"),
        }
    }

    /// Returns true if committed entries are waiting to be applied.
    #[must_use]
    pub fn has_next_committed_ents(&self, allow_unstable: bool) -> bool {
        if self.applying_ents_paused || self.has_next_or_in_progress_snapshot() {
            return false;
        }
        self.applying + 1 < self.max_appliable_index(allow_unstable) + 1
    }

    fn max_appliable_index(&self, allow_unstable: bool) -> u64 {
        if allow_unstable {
            self.committed
        } else {
            self.committed.min(self.unstable.offset - 1)
        }
    }

    /// Unstable snapshot not yet handed out for persistence.
    #[must_use]
    pub fn next_unstable_snapshot(&self) -> Option<&Snapshot> {
        self.unstable.next_snapshot()
    }

    /// Returns true if an unstable snapshot is waiting to be handed out.
    #[must_use]
    pub fn has_next_unstable_snapshot(&self) -> bool {
        self.unstable.next_snapshot().is_some()
    }

    /// Returns true if an unstable snapshot exists, handed out or not.
    #[must_use]
    pub const fn has_next_or_in_progress_snapshot(&self) -> bool {
        self.unstable.snapshot.is_some()
    }

    /// The most recent snapshot, unstable or durable.
    ///
    /// # Errors
    /// Propagates storage errors such as `SnapshotTemporarilyUnavailable`.
    pub fn snapshot(&self) -> StorageResult<Snapshot> {
        if let Some(snapshot) = &self.unstable.snapshot {
            return Ok(snapshot.clone());
        }
        self.store.snapshot()
    }

    /// Index of the first entry.
    ///
    /// # Panics
    /// Panics if the storage cannot report it.
    #[must_use]
    pub fn first_index(&self) -> u64 {
        self.unstable
            .maybe_first_index()
            .unwrap_or_else(|| must(self.store.first_index(), "first index"))
    }

    /// Index of the last entry.
    ///
    /// # Panics
    /// Panics if the storage cannot report it.
    #[must_use]
    pub fn last_index(&self) -> u64 {
        self.unstable
            .maybe_last_index()
            .unwrap_or_else(|| must(self.store.last_index(), "last index"))
    }

    /// Term of the last entry.
    ///
    /// # Panics
    /// Panics if the last term cannot be read.
    #[must_use]
    pub fn last_term(&self) -> u64 {
        match self.term(self.last_index()) {
            Ok(term) => term,
            Err(e) => panic!("unexpected error when getting the last term ({e})"),
        }
    }

    /// Advances the commit index. Never moves it backwards.
    ///
    /// # Panics
    /// Panics if `to_commit` is beyond the last index.
    pub fn commit_to(&mut self, to_commit: u64) {
        if self.committed < to_commit {
            assert!(
                self.last_index() >= to_commit,
                "tocommit({to_commit}) is out of range [lastIndex({})]. \
                 Was the raft log corrupted, truncated, or lost?",
                self.last_index()
            );
            self.committed = to_commit;
        }
    }

    /// Records that entries up to `index` (of total size `size`) were applied.
    ///
    /// # Panics
    /// Panics if `index` is not in `[applied, committed]`.
    pub fn applied_to(&mut self, index: u64, size: u64) {
        assert!(
            self.committed >= index && index >= self.applied,
            "applied({index}) is out of range [prevApplied({}), committed({})]",
            self.applied,
            self.committed
        );
        self.applied = index;
        self.applying = self.applying.max(index);
        self.applying_ents_size = self.applying_ents_size.saturating_sub(size);
        self.applying_ents_paused = self.applying_ents_size >= self.max_applying_ents_size;
    }

    /// Records that entries up to `index` were handed out for applying.
    ///
    /// # Panics
    /// Panics if `index` is beyond the commit index.
    pub fn accept_applying(&mut self, index: u64, size: u64, allow_unstable: bool) {
        assert!(
            self.committed >= index,
            "applying({index}) is out of range [prevApplying({}), committed({})]",
            self.applying,
            self.committed
        );
        self.applying = index;
        self.applying_ents_size = self.applying_ents_size.saturating_add(size);
        // Pause when the budget is spent, or when the last batch was cut
        // short by size: the next batch is released once the application
        // catches up.
        self.applying_ents_paused = self.applying_ents_size >= self.max_applying_ents_size
            || index < self.max_appliable_index(allow_unstable);
    }

    /// Records that entries up to `(index, term)` are durable.
    pub fn stable_to(&mut self, index: u64, term: u64) {
        self.unstable.stable_to(index, term);
    }

    /// Records that the snapshot at `index` is durable.
    pub fn stable_snap_to(&mut self, index: u64) {
        self.unstable.stable_snap_to(index);
    }

    /// Marks all unstable content as handed out for persistence.
    pub fn accept_unstable(&mut self) {
        self.unstable.accept_in_progress();
    }

    /// Term of the entry at `index`.
    ///
    /// # Errors
    /// `Compacted` below the first index (the index just before it is
    /// still answered), `Unavailable` beyond the last index.
    ///
    /// # Panics
    /// Panics on any other storage error.
    pub fn term(&self, index: u64) -> StorageResult<u64> {
        if let Some(term) = self.unstable.maybe_term(index) {
            return Ok(term);
        }

        // The valid term range is [first_index - 1, last_index].
        if index + 1 < self.first_index() {
            return Err(StorageError::Compacted);
        }
        if index > self.last_index() {
            return Err(StorageError::Unavailable);
        }

        match self.store.term(index) {
            Ok(term) => Ok(term),
            Err(e @ (StorageError::Compacted | StorageError::Unavailable)) => Err(e),
            Err(e) => panic!("unexpected error when getting term {index} ({e})"),
        }
    }

    /// Entries from `index` to the end, at most `max_size` bytes.
    ///
    /// # Errors
    /// `Compacted` if `index` has been compacted away.
    pub fn entries(&self, index: u64, max_size: u64) -> StorageResult<Vec<Entry>> {
        if index > self.last_index() {
            return Ok(Vec::new());
        }
        self.slice(index, self.last_index() + 1, max_size)
    }

    /// Every entry in the log.
    ///
    /// # Panics
    /// Panics on unexpected storage errors.
    #[must_use]
    pub fn all_entries(&self) -> Vec<Entry> {
        loop {
            match self.entries(self.first_index(), u64::MAX) {
                Ok(entries) => return entries,
                // Compaction raced with the read; retry from the new start.
                Err(StorageError::Compacted) => {}
                Err(e) => panic!("unexpected error reading all entries ({e})"),
            }
        }
    }

    /// Returns true if a log ending at `(last_index, term)` is at least as
    /// up to date as this one.
    #[must_use]
    pub fn is_up_to_date(&self, last_index: u64, term: u64) -> bool {
        let our_term = self.last_term();
        term > our_term || (term == our_term && last_index >= self.last_index())
    }

    /// Returns true if the entry at `index` has term `term`.
    #[must_use]
    pub fn match_term(&self, index: u64, term: u64) -> bool {
        self.term(index).is_ok_and(|t| t == term)
    }

    /// Advances the commit index to `max_index` if it is newer and the entry
    /// there belongs to `term`.
    ///
    /// The leader calls this with its current term: entries from earlier
    /// terms are only committed indirectly, once an entry of the current
    /// term is.
    pub fn maybe_commit(&mut self, max_index: u64, term: u64) -> bool {
        if term != 0 && max_index > self.committed && self.match_term(max_index, term) {
            self.commit_to(max_index);
            return true;
        }
        false
    }

    /// Resets the log to start right after `snapshot`.
    pub fn restore(&mut self, snapshot: Snapshot) {
        info!(
            log = %self,
            index = snapshot.metadata.index,
            term = snapshot.metadata.term,
            "log starts to restore snapshot"
        );
        self.committed = snapshot.metadata.index;
        self.unstable.restore(snapshot);
    }

    /// Entries in `[lo, hi)`, at most `max_size` bytes but at least one.
    ///
    /// # Errors
    /// `Compacted` if `lo` has been compacted away.
    ///
    /// # Panics
    /// Panics if the range is past the end of the log or storage fails
    /// unexpectedly.
    pub fn slice(&self, lo: u64, hi: u64, max_size: u64) -> StorageResult<Vec<Entry>> {
        self.must_check_out_of_bounds(lo, hi)?;
        if lo == hi {
            return Ok(Vec::new());
        }

        let offset = self.unstable.offset;
        if lo >= offset {
            let mut entries = self.unstable.slice(lo, hi).to_vec();
            limit_size(&mut entries, max_size);
            return Ok(entries);
        }

        let cut = hi.min(offset);
        let mut entries = match self.store.entries(lo, cut, max_size) {
            Ok(entries) => entries,
            Err(StorageError::Compacted) => return Err(StorageError::Compacted),
            Err(StorageError::Unavailable) => {
                panic!("entries[{lo}:{cut}) is unavailable from storage")
            }
            Err(e) => panic!("unexpected error reading entries[{lo}:{cut}) ({e})"),
        };
        if hi <= offset {
            return Ok(entries);
        }

        // Storage returned fewer entries than asked because of the size
        // limit; don't bother with the unstable part.
        if (entries.len() as u64) < cut - lo {
            return Ok(entries);
        }
        let size = entries_size(&entries);
        if size >= max_size {
            return Ok(entries);
        }

        let mut unstable = self.unstable.slice(offset, hi).to_vec();
        limit_size(&mut unstable, max_size - size);
        // limit_size keeps one entry even if it does not fit.
        if unstable.len() == 1 && size + entries_size(&unstable) > max_size {
            return Ok(entries);
        }
        entries.extend(unstable);
        Ok(entries)
    }

    fn must_check_out_of_bounds(&self, lo: u64, hi: u64) -> StorageResult<()> {
        assert!(lo <= hi, "invalid slice {lo} > {hi}");
        let first = self.first_index();
        if lo < first {
            return Err(StorageError::Compacted);
        }
        let last = self.last_index();
        assert!(
            hi <= last + 1,
            "slice[{lo},{hi}) out of bound [{first},{last}]"
        );
        Ok(())
    }

    /// Maps out-of-range lookups to term 0.
    ///
    /// # Panics
    /// Panics on any other storage error.
    #[must_use]
    pub fn zero_term_on_out_of_bounds(&self, term: StorageResult<u64>) -> u64 {
        match term {
            Ok(term) => term,
            Err(StorageError::Compacted | StorageError::Unavailable) => 0,
            Err(e) => panic!("unexpected error ({e})"),
        }
    }
}

impl<S: Storage> fmt::Display for RaftLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "committed={}, applied={}, applying={}, unstable.offset={}, \
             unstable.offset_in_progress={}, len(unstable.entries)={}",
            self.committed,
            self.applied,
            self.applying,
            self.unstable.offset,
            self.unstable.offset_in_progress,
            self.unstable.entries.len()
        )
    }
}

impl<S: Storage> fmt::Debug for RaftLog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaftLog {{ {self} }}")
    }
}

fn must(result: StorageResult<u64>, what: &str) -> u64 {
    match result {
        Ok(value) => value,
        Err(e) => panic!("unexpected error getting {what} from storage ({e})"),
    }
}
