//! Point-in-time snapshots of a replica's state for diagnostics.

use std::fmt;

use keel_core::NodeId;

use crate::message::HardState;
use crate::state::{Raft, SoftState, StateRole};
use crate::storage::Storage;
use crate::tracker::{ProgressMap, TrackerConfig};

/// State of a replica at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// The replica.
    pub id: NodeId,
    /// Term, vote and commit.
    pub hard_state: HardState,
    /// Leader and role.
    pub soft_state: SoftState,
    /// Highest applied index.
    pub applied: u64,
    /// Target of an in-progress leadership transfer, or `NONE`.
    pub lead_transferee: NodeId,
    /// Active membership.
    pub config: TrackerConfig,
    /// Per-peer replication progress. Only populated on the leader.
    pub progress: ProgressMap,
}

impl Status {
    pub(crate) fn new<S: Storage>(raft: &Raft<S>) -> Self {
        let progress = if raft.state == StateRole::Leader {
            raft.tracker().progress().clone()
        } else {
            ProgressMap::new()
        };
        Self {
            id: raft.id,
            hard_state: raft.hard_state(),
            soft_state: raft.soft_state(),
            applied: raft.raft_log.applied,
            lead_transferee: raft.lead_transferee,
            config: raft.tracker().config().clone(),
            progress,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} term={} vote={} commit={} applied={} lead={}",
            self.id,
            self.soft_state.raft_state,
            self.hard_state.term,
            self.hard_state.vote,
            self.hard_state.commit,
            self.applied,
            self.soft_state.lead,
        )?;
        for (id, pr) in &self.progress {
            write!(f, "\n  {id}: {pr}")?;
        }
        Ok(())
    }
}
