//! A simple majority configuration.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Deref, DerefMut};

use keel_core::NodeId;

use super::{AckedIndexer, VoteResult};

/// A set of voters deciding by simple majority.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MajorityConfig {
    voters: BTreeSet<NodeId>,
}

impl MajorityConfig {
    /// Creates a configuration from a set of voters.
    #[must_use]
    pub const fn new(voters: BTreeSet<NodeId>) -> Self {
        Self { voters }
    }

    /// Number of votes needed to decide: `floor(n/2) + 1`.
    #[must_use]
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Returns the voters in ascending order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<NodeId> {
        self.voters.iter().copied().collect()
    }

    /// Returns the largest index acknowledged by a quorum.
    ///
    /// Voters without a known acknowledgement count as having acknowledged
    /// index 0. An empty configuration returns `u64::MAX`, so that an unused
    /// half of a joint configuration never constrains the other half.
    #[must_use]
    pub fn committed_index(&self, acked: &impl AckedIndexer) -> u64 {
        if self.voters.is_empty() {
            return u64::MAX;
        }

        let mut indexes: Vec<u64> = self
            .voters
            .iter()
            .map(|&id| acked.acked_index(id).unwrap_or(0))
            .collect();
        indexes.sort_unstable();

        // The quorum-th largest value: everything at or after this position
        // forms a quorum that has acknowledged at least this index.
        let n = indexes.len();
        indexes[n - self.quorum()]
    }

    /// Tallies a vote. `votes` reports `Some(granted)` for voters that have
    /// answered and `None` for outstanding ones.
    ///
    /// An empty configuration wins by definition, which lets a joint
    /// configuration with an empty half behave like its other half.
    #[must_use]
    pub fn vote_result(&self, votes: impl Fn(NodeId) -> Option<bool>) -> VoteResult {
        if self.voters.is_empty() {
            return VoteResult::Won;
        }

        let (mut yes, mut missing) = (0, 0);
        for &id in &self.voters {
            match votes(id) {
                Some(true) => yes += 1,
                Some(false) => {}
                None => missing += 1,
            }
        }

        let quorum = self.quorum();
        if yes >= quorum {
            VoteResult::Won
        } else if yes + missing >= quorum {
            VoteResult::Pending
        } else {
            VoteResult::Lost
        }
    }
}

impl Deref for MajorityConfig {
    type Target = BTreeSet<NodeId>;

    fn deref(&self) -> &Self::Target {
        &self.voters
    }
}

impl DerefMut for MajorityConfig {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.voters
    }
}

impl FromIterator<NodeId> for MajorityConfig {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl fmt::Display for MajorityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, id) in self.voters.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", id.get())?;
        }
        f.write_str(")")
    }
}
