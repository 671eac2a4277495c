//! The batch of work handed from the state machine to its driver.

use crate::message::{Entry, HardState, Message, Snapshot};
use crate::read_only::ReadState;
use crate::state::SoftState;

/// Everything the driver must persist, send or apply before the next step.
///
/// In synchronous mode the driver persists `hard_state`, `entries` and
/// `snapshot`, then sends `messages`, applies `committed_entries`, and
/// finally calls [`RawNode::advance`](crate::RawNode::advance).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ready {
    /// Set when the volatile state changed.
    pub soft_state: Option<SoftState>,
    /// Set when term, vote or commit changed. Must be persisted.
    pub hard_state: Option<HardState>,
    /// Reads served since the last ready.
    pub read_states: Vec<ReadState>,
    /// Entries to persist before `messages` are sent.
    pub entries: Vec<Entry>,
    /// Snapshot to persist.
    pub snapshot: Option<Snapshot>,
    /// Entries to apply to the application state machine.
    pub committed_entries: Vec<Entry>,
    /// Outbound messages. In asynchronous mode this also carries the
    /// storage messages addressed to the local append and apply threads.
    pub messages: Vec<Message>,
    /// True if the hard state and entries must be synced to disk before
    /// anything else happens.
    pub must_sync: bool,
}

impl Ready {
    /// Returns true if there is anything to do.
    #[must_use]
    pub fn contains_updates(&self) -> bool {
        self.soft_state.is_some()
            || self.hard_state.is_some_and(|hs| !hs.is_empty())
            || self.snapshot.as_ref().is_some_and(|s| !s.is_empty())
            || !self.entries.is_empty()
            || !self.committed_entries.is_empty()
            || !self.messages.is_empty()
            || !self.read_states.is_empty()
    }

    /// Highest index the application will have applied once this ready
    /// is handled, or 0 if it applies nothing.
    #[must_use]
    pub fn applied_cursor(&self) -> u64 {
        if let Some(last) = self.committed_entries.last() {
            return last.index;
        }
        self.snapshot.as_ref().map_or(0, |s| s.metadata.index)
    }
}

/// Returns true if persisting `st` (with `entries` new entries) requires a
/// synchronous write. Term, vote and log entries must be durable before
/// they are acted upon; the commit index may be recovered.
#[must_use]
pub fn must_sync(st: &HardState, prev: &HardState, entries: usize) -> bool {
    entries != 0 || st.vote != prev.vote || st.term != prev.term
}
