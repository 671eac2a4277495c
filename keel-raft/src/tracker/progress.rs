//! Per-peer replication progress as seen by the leader.

use std::fmt;

use super::Inflights;

/// How the leader is currently replicating to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressState {
    /// The leader does not know where the peer's log ends; at most one
    /// append is in flight until the peer answers.
    #[default]
    Probe,
    /// The peer's log is known; appends are streamed optimistically,
    /// bounded by the inflight window.
    Replicate,
    /// The peer needs a snapshot; appends are suspended.
    Snapshot,
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Probe => "StateProbe",
            Self::Replicate => "StateReplicate",
            Self::Snapshot => "StateSnapshot",
        };
        f.write_str(name)
    }
}

/// Replication cursor for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Highest index known to be replicated on the peer.
    pub matched: u64,
    /// Next index to send.
    pub next_idx: u64,
    /// Replication state.
    pub state: ProgressState,
    /// Index of the snapshot in flight, while in `Snapshot` state.
    pub pending_snapshot: u64,
    /// Whether the peer was heard from since the last quorum check.
    pub recent_active: bool,
    /// Whether appends to the peer are throttled.
    pub msg_app_flow_paused: bool,
    /// Unacknowledged appends.
    pub inflights: Inflights,
    /// Whether the peer is a learner.
    pub is_learner: bool,
}

impl Progress {
    /// Creates a progress probing from `next_idx`.
    #[must_use]
    pub fn new(next_idx: u64, max_inflight: usize, max_inflight_bytes: u64) -> Self {
        Self {
            matched: 0,
            next_idx,
            state: ProgressState::Probe,
            pending_snapshot: 0,
            recent_active: false,
            msg_app_flow_paused: false,
            inflights: Inflights::new(max_inflight, max_inflight_bytes),
            is_learner: false,
        }
    }

    fn reset_state(&mut self, state: ProgressState) {
        self.msg_app_flow_paused = false;
        self.pending_snapshot = 0;
        self.state = state;
        self.inflights.reset();
    }

    /// Moves to `Probe`. Coming from `Snapshot`, probing resumes after the
    /// snapshot's index since the peer will have applied it.
    pub fn become_probe(&mut self) {
        if self.state == ProgressState::Snapshot {
            let pending_snapshot = self.pending_snapshot;
            self.reset_state(ProgressState::Probe);
            self.next_idx = (self.matched + 1).max(pending_snapshot + 1);
        } else {
            self.reset_state(ProgressState::Probe);
            self.next_idx = self.matched + 1;
        }
    }

    /// Moves to `Replicate`.
    pub fn become_replicate(&mut self) {
        self.reset_state(ProgressState::Replicate);
        self.next_idx = self.matched + 1;
    }

    /// Moves to `Snapshot`, waiting for the snapshot at `snapshot_idx`.
    pub fn become_snapshot(&mut self, snapshot_idx: u64) {
        self.reset_state(ProgressState::Snapshot);
        self.pending_snapshot = snapshot_idx;
    }

    /// Records that `entries` entries of `bytes` bytes starting at
    /// `next_idx` were sent.
    ///
    /// # Panics
    /// Panics when called in `Snapshot` state; nothing is sent then.
    pub fn update_on_entries_send(&mut self, entries: usize, bytes: u64, next_idx: u64) {
        match self.state {
            ProgressState::Replicate => {
                if entries > 0 {
                    let last = next_idx + entries as u64 - 1;
                    self.optimistic_update(last);
                    self.inflights.add(last, bytes);
                }
                self.msg_app_flow_paused = self.inflights.full();
            }
            ProgressState::Probe => {
                // One probe at a time: wait for the answer (or a heartbeat
                // response) before sending again.
                if entries > 0 {
                    self.msg_app_flow_paused = true;
                }
            }
            ProgressState::Snapshot => {
                panic!("sending append in unhandled state {}", self.state);
            }
        }
    }

    /// Advances `matched` to `n` if it is newer. Stale or duplicate
    /// acknowledgements leave the progress untouched apart from `next_idx`,
    /// which never moves backwards.
    pub fn maybe_update(&mut self, n: u64) -> bool {
        let updated = if self.matched < n {
            self.matched = n;
            self.msg_app_flow_paused = false;
            true
        } else {
            false
        };
        self.next_idx = self.next_idx.max(n + 1);
        updated
    }

    /// Advances `next_idx` past an optimistically sent append.
    pub fn optimistic_update(&mut self, n: u64) {
        self.next_idx = n + 1;
    }

    /// Adjusts `next_idx` after the peer rejected an append at `rejected`,
    /// hinting that its log matches at most up to `match_hint`.
    ///
    /// Returns false if the rejection is stale and was ignored.
    pub fn maybe_decr_to(&mut self, rejected: u64, match_hint: u64) -> bool {
        if self.state == ProgressState::Replicate {
            if rejected <= self.matched {
                return false;
            }
            self.next_idx = self.matched + 1;
            return true;
        }

        // In Probe the rejection must answer the one outstanding probe.
        if self.next_idx - 1 != rejected {
            return false;
        }

        self.next_idx = rejected.min(match_hint + 1).max(1);
        self.msg_app_flow_paused = false;
        true
    }

    /// Returns true if appends to this peer are currently throttled.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        match self.state {
            ProgressState::Probe | ProgressState::Replicate => self.msg_app_flow_paused,
            ProgressState::Snapshot => true,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} match={} next={}",
            self.state, self.matched, self.next_idx
        )?;
        if self.is_learner {
            f.write_str(" learner")?;
        }
        if self.is_paused() {
            f.write_str(" paused")?;
        }
        if self.pending_snapshot > 0 {
            write!(f, " pendingSnap={}", self.pending_snapshot)?;
        }
        if !self.recent_active {
            f.write_str(" inactive")?;
        }
        let n = self.inflights.count();
        if n > 0 {
            write!(f, " inflight={n}")?;
            if self.inflights.full() {
                f.write_str("[full]")?;
            }
        }
        Ok(())
    }
}
