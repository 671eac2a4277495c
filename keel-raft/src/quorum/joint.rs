//! Joint configurations: two majorities that must agree.

use std::collections::BTreeSet;
use std::fmt;

use keel_core::NodeId;

use super::{AckedIndexer, MajorityConfig, VoteResult};

/// A pair of majority configurations used during membership changes.
///
/// `incoming` is the configuration being moved to; `outgoing` is empty
/// unless a joint transition is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JointConfig {
    /// The configuration being transitioned to (or the only one).
    pub incoming: MajorityConfig,
    /// The configuration being transitioned away from.
    pub outgoing: MajorityConfig,
}

impl JointConfig {
    /// Creates a non-joint configuration of the given voters.
    #[must_use]
    pub fn new(voters: BTreeSet<NodeId>) -> Self {
        Self {
            incoming: MajorityConfig::new(voters),
            outgoing: MajorityConfig::default(),
        }
    }

    /// Returns true if a joint transition is in progress.
    #[must_use]
    pub fn is_joint(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Returns the union of both halves.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<NodeId> {
        self.incoming.union(&self.outgoing).copied().collect()
    }

    /// Returns true if `id` votes in either half.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.incoming.contains(&id) || self.outgoing.contains(&id)
    }

    /// Returns true if the configuration consists of exactly one voter.
    #[must_use]
    pub fn is_singleton(&self) -> bool {
        self.outgoing.is_empty() && self.incoming.len() == 1
    }

    /// Returns the largest index committed by both halves.
    #[must_use]
    pub fn committed_index(&self, acked: &impl AckedIndexer) -> u64 {
        let incoming = self.incoming.committed_index(acked);
        let outgoing = self.outgoing.committed_index(acked);
        incoming.min(outgoing)
    }

    /// Tallies a vote across both halves.
    ///
    /// Agreement wins or loses outright; a loss in either half loses the
    /// whole vote; anything else is pending.
    #[must_use]
    pub fn vote_result(&self, votes: impl Fn(NodeId) -> Option<bool>) -> VoteResult {
        let r1 = self.incoming.vote_result(&votes);
        let r2 = self.outgoing.vote_result(&votes);

        if r1 == r2 {
            return r1;
        }
        if r1 == VoteResult::Lost || r2 == VoteResult::Lost {
            return VoteResult::Lost;
        }
        VoteResult::Pending
    }

    /// Drops the outgoing half.
    pub fn clear_outgoing(&mut self) {
        self.outgoing.clear();
    }
}

impl fmt::Display for JointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outgoing.is_empty() {
            write!(f, "{}", self.incoming)
        } else {
            write!(f, "{}&&{}", self.incoming, self.outgoing)
        }
    }
}
