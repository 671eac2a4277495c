//! Majority and joint quorum computations.
//!
//! Everything here is pure: given a set of voters and their acknowledgements
//! it answers "what index is committed" and "who won the vote". Results
//! never depend on iteration order.

mod joint;
mod majority;

pub use joint::JointConfig;
pub use majority::MajorityConfig;

use std::collections::{BTreeMap, HashMap};

use keel_core::NodeId;

/// Outcome of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    /// Some votes are still outstanding and could decide either way.
    Pending,
    /// The vote is lost regardless of outstanding votes.
    Lost,
    /// A quorum has voted yes.
    Won,
}

/// Looks up the index a voter has acknowledged.
pub trait AckedIndexer {
    /// Returns the acknowledged index of `voter`, if it is known.
    fn acked_index(&self, voter: NodeId) -> Option<u64>;
}

impl AckedIndexer for HashMap<NodeId, u64> {
    fn acked_index(&self, voter: NodeId) -> Option<u64> {
        self.get(&voter).copied()
    }
}

impl AckedIndexer for BTreeMap<NodeId, u64> {
    fn acked_index(&self, voter: NodeId) -> Option<u64> {
        self.get(&voter).copied()
    }
}
