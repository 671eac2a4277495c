//! Tracks the active configuration and the replication progress of every
//! peer in it.

mod inflights;
mod progress;

pub use inflights::Inflights;
pub use progress::{Progress, ProgressState};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use keel_core::NodeId;

use crate::message::ConfState;
use crate::quorum::{AckedIndexer, JointConfig, VoteResult};

/// Progress of every tracked peer, keyed by ID.
///
/// Ordered so that iteration (and therefore message emission) is
/// deterministic.
pub type ProgressMap = BTreeMap<NodeId, Progress>;

/// Membership of the group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackerConfig {
    /// Voters; joint while a membership change is in flight.
    pub voters: JointConfig,
    /// Learners. Never overlaps with either half of `voters`.
    pub learners: BTreeSet<NodeId>,
    /// Outgoing voters that become learners once the joint configuration
    /// is left. They stay voters until then, so they are not in `learners`.
    pub learners_next: BTreeSet<NodeId>,
    /// Leave the joint configuration automatically once it is committed.
    pub auto_leave: bool,
}

impl TrackerConfig {
    /// Returns the flat membership description of this configuration.
    #[must_use]
    pub fn to_conf_state(&self) -> ConfState {
        ConfState {
            voters: self.voters.incoming.to_vec(),
            voters_outgoing: self.voters.outgoing.to_vec(),
            learners: self.learners.iter().copied().collect(),
            learners_next: self.learners_next.iter().copied().collect(),
            auto_leave: self.auto_leave,
        }
    }
}

impl fmt::Display for TrackerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ids(set: &BTreeSet<NodeId>) -> String {
            let ids: Vec<String> = set.iter().map(|id| id.get().to_string()).collect();
            format!("({})", ids.join(" "))
        }

        write!(f, "voters={}", self.voters)?;
        if !self.learners.is_empty() {
            write!(f, " learners={}", ids(&self.learners))?;
        }
        if !self.learners_next.is_empty() {
            write!(f, " learners_next={}", ids(&self.learners_next))?;
        }
        if self.auto_leave {
            f.write_str(" autoleave")?;
        }
        Ok(())
    }
}

struct MatchAckIndexer<'a>(&'a ProgressMap);

impl AckedIndexer for MatchAckIndexer<'_> {
    fn acked_index(&self, voter: NodeId) -> Option<u64> {
        self.0.get(&voter).map(|pr| pr.matched)
    }
}

/// The leader's view of the group: configuration, per-peer progress and
/// votes collected during a campaign.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    config: TrackerConfig,
    progress: ProgressMap,
    votes: BTreeMap<NodeId, bool>,
    max_inflight: usize,
    max_inflight_bytes: u64,
}

impl ProgressTracker {
    /// Creates an empty tracker whose peers get windows of the given size.
    #[must_use]
    pub fn new(max_inflight: usize, max_inflight_bytes: u64) -> Self {
        Self {
            config: TrackerConfig::default(),
            progress: ProgressMap::new(),
            votes: BTreeMap::new(),
            max_inflight,
            max_inflight_bytes,
        }
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Progress of every tracked peer.
    #[must_use]
    pub const fn progress(&self) -> &ProgressMap {
        &self.progress
    }

    /// Mutable progress of every tracked peer.
    pub fn progress_mut(&mut self) -> &mut ProgressMap {
        &mut self.progress
    }

    /// Progress of one peer.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Progress> {
        self.progress.get(&id)
    }

    /// Mutable progress of one peer.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Progress> {
        self.progress.get_mut(&id)
    }

    /// Window size given to new peers.
    #[must_use]
    pub const fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    /// Window byte budget given to new peers.
    #[must_use]
    pub const fn max_inflight_bytes(&self) -> u64 {
        self.max_inflight_bytes
    }

    /// Installs a configuration and progress map produced by the
    /// [`Changer`](crate::confchange::Changer).
    pub fn apply(&mut self, config: TrackerConfig, progress: ProgressMap) {
        self.config = config;
        self.progress = progress;
    }

    /// Flat membership description of the current configuration.
    #[must_use]
    pub fn conf_state(&self) -> ConfState {
        self.config.to_conf_state()
    }

    /// Returns true if the group consists of a single voter.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.config.voters.is_singleton()
    }

    /// Largest index replicated on a quorum of voters.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.config
            .voters
            .committed_index(&MatchAckIndexer(&self.progress))
    }

    /// Returns true if a quorum of voters was recently active.
    #[must_use]
    pub fn quorum_active(&self) -> bool {
        let votes: BTreeMap<NodeId, bool> = self
            .progress
            .iter()
            .filter(|(_, pr)| !pr.is_learner)
            .map(|(&id, pr)| (id, pr.recent_active))
            .collect();
        self.config.voters.vote_result(|id| votes.get(&id).copied()) == VoteResult::Won
    }

    /// Voter IDs in ascending order.
    #[must_use]
    pub fn voter_nodes(&self) -> Vec<NodeId> {
        self.config.voters.ids().into_iter().collect()
    }

    /// Learner IDs in ascending order.
    #[must_use]
    pub fn learner_nodes(&self) -> Vec<NodeId> {
        self.config.learners.iter().copied().collect()
    }

    /// Forgets all recorded votes.
    pub fn reset_votes(&mut self) {
        self.votes.clear();
    }

    /// Records a vote. Only the first vote of each peer counts.
    pub fn record_vote(&mut self, id: NodeId, granted: bool) {
        self.votes.entry(id).or_insert(granted);
    }

    /// The vote recorded for `id`, if any.
    #[must_use]
    pub fn vote(&self, id: NodeId) -> Option<bool> {
        self.votes.get(&id).copied()
    }

    /// Tallies recorded votes: `(granted, rejected, result)`.
    #[must_use]
    pub fn tally_votes(&self) -> (usize, usize, VoteResult) {
        let (mut granted, mut rejected) = (0, 0);
        for (id, pr) in &self.progress {
            if pr.is_learner {
                continue;
            }
            match self.votes.get(id) {
                Some(true) => granted += 1,
                Some(false) => rejected += 1,
                None => {}
            }
        }
        let result = self
            .config
            .voters
            .vote_result(|id| self.votes.get(&id).copied());
        (granted, rejected, result)
    }
}
