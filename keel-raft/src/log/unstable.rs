//! Entries and snapshot that have not been persisted yet.

use tracing::info;

use crate::message::{Entry, Snapshot};

/// The in-memory suffix of the log.
///
/// `entries[i]` has log index `offset + i`. An incoming snapshot sits in
/// front of `entries`; while it is set, `offset` is its index plus one.
/// Items before `offset_in_progress` (and the snapshot, once
/// `snapshot_in_progress`) have been handed to the driver for persistence
/// but are not yet acknowledged.
#[derive(Debug, Clone, Default)]
pub struct Unstable {
    /// Incoming snapshot, if any.
    pub snapshot: Option<Snapshot>,
    /// Entries not yet known to be durable.
    pub entries: Vec<Entry>,
    /// Index of `entries[0]`.
    pub offset: u64,
    /// Whether the snapshot has been handed out for persistence.
    pub snapshot_in_progress: bool,
    /// First index not yet handed out for persistence.
    pub offset_in_progress: u64,
}

impl Unstable {
    /// Creates an empty unstable log starting at `offset`.
    #[must_use]
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            offset_in_progress: offset,
            ..Self::default()
        }
    }

    /// First index, if only known from the unstable snapshot.
    #[must_use]
    pub fn maybe_first_index(&self) -> Option<u64> {
        self.snapshot.as_ref().map(|s| s.metadata.index + 1)
    }

    /// Last index, if there are unstable entries or a snapshot.
    #[must_use]
    pub fn maybe_last_index(&self) -> Option<u64> {
        if !self.entries.is_empty() {
            return Some(self.offset + self.entries.len() as u64 - 1);
        }
        self.snapshot.as_ref().map(|s| s.metadata.index)
    }

    /// Term of the entry at `index`, if it is held here.
    #[must_use]
    pub fn maybe_term(&self, index: u64) -> Option<u64> {
        if index < self.offset {
            return self
                .snapshot
                .as_ref()
                .filter(|s| s.metadata.index == index)
                .map(|s| s.metadata.term);
        }

        let last = self.maybe_last_index()?;
        if index > last {
            return None;
        }
        Some(self.entries[(index - self.offset) as usize].term)
    }

    /// Entries not yet handed out for persistence.
    #[must_use]
    pub fn next_entries(&self) -> &[Entry] {
        let in_progress = (self.offset_in_progress - self.offset) as usize;
        &self.entries[in_progress..]
    }

    /// Snapshot not yet handed out for persistence.
    #[must_use]
    pub fn next_snapshot(&self) -> Option<&Snapshot> {
        if self.snapshot_in_progress {
            return None;
        }
        self.snapshot.as_ref()
    }

    /// Marks everything currently held as handed out for persistence.
    pub fn accept_in_progress(&mut self) {
        if let Some(last) = self.entries.last() {
            self.offset_in_progress = last.index + 1;
        }
        if self.snapshot.is_some() {
            self.snapshot_in_progress = true;
        }
    }

    /// Drops entries up to `index` now that they are durable.
    ///
    /// Acknowledgements that no longer match the log (the entry was
    /// replaced in the meantime) are ignored.
    pub fn stable_to(&mut self, index: u64, term: u64) {
        let Some(gt) = self.maybe_term(index) else {
            info!(index, "entry missing from unstable log; ignoring");
            return;
        };
        if index < self.offset {
            info!(index, "entry matched unstable snapshot; ignoring");
            return;
        }
        if gt != term {
            info!(
                index,
                term,
                unstable_term = gt,
                "entry term mismatched with unstable log; ignoring"
            );
            return;
        }

        let num = (index + 1 - self.offset) as usize;
        self.entries.drain(..num);
        self.offset = index + 1;
        self.offset_in_progress = self.offset_in_progress.max(self.offset);
        self.shrink_entries();
    }

    // Release the backing array once it is mostly empty.
    fn shrink_entries(&mut self) {
        const LEN_MULTIPLE: usize = 2;
        if self.entries.is_empty() {
            self.entries = Vec::new();
        } else if self.entries.len() * LEN_MULTIPLE < self.entries.capacity() {
            self.entries.shrink_to_fit();
        }
    }

    /// Drops the snapshot now that it is durable.
    pub fn stable_snap_to(&mut self, index: u64) {
        if self.snapshot.as_ref().map(|s| s.metadata.index) == Some(index) {
            self.snapshot = None;
            self.snapshot_in_progress = false;
        }
    }

    /// Replaces everything with `snapshot`.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.offset = snapshot.metadata.index + 1;
        self.offset_in_progress = self.offset;
        self.entries.clear();
        self.snapshot = Some(snapshot);
        self.snapshot_in_progress = false;
    }

    /// Appends `entries`, truncating any conflicting suffix first.
    pub fn truncate_and_append(&mut self, entries: &[Entry]) {
        let Some(first) = entries.first() else {
            return;
        };
        let from = first.index;

        if from == self.offset + self.entries.len() as u64 {
            // Directly after the current tail.
            self.entries.extend_from_slice(entries);
        } else if from <= self.offset {
            // Replaces everything held here.
            info!(index = from, "replace the unstable entries from index");
            self.entries = entries.to_vec();
            self.offset = from;
            self.offset_in_progress = self.offset;
        } else {
            // Truncate to `from` and append.
            info!(index = from, "truncate the unstable entries before index");
            self.must_check_out_of_bounds(self.offset, from);
            self.entries.truncate((from - self.offset) as usize);
            self.entries.extend_from_slice(entries);
            self.offset_in_progress = self.offset_in_progress.min(from);
        }
    }

    /// Returns the unstable entries in `[lo, hi)`.
    ///
    /// # Panics
    /// Panics if the range is not held here.
    #[must_use]
    pub fn slice(&self, lo: u64, hi: u64) -> &[Entry] {
        self.must_check_out_of_bounds(lo, hi);
        &self.entries[(lo - self.offset) as usize..(hi - self.offset) as usize]
    }

    fn must_check_out_of_bounds(&self, lo: u64, hi: u64) {
        assert!(lo <= hi, "invalid unstable.slice {lo} > {hi}");
        let upper = self.offset + self.entries.len() as u64;
        assert!(
            lo >= self.offset && hi <= upper,
            "unstable.slice[{lo}, {hi}) out of bound [{}, {upper}]",
            self.offset
        );
    }
}
