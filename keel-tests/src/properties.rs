//! Property definitions and checkers for cluster simulations.
//!
//! Properties are invariants that must hold throughout a run. The checker
//! observes the cluster after every step and remembers what it saw, so
//! properties that span time (one leader per term, committed entries never
//! change) are checked against the whole history and not just a snapshot.

use std::collections::{BTreeMap, BTreeSet};

use keel_raft::StateRole;

use crate::cluster::{SimCluster, SimNode};

// ============================================================================
// Property Violation Types
// ============================================================================

/// A violation of a Raft safety property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyViolation {
    /// Multiple leaders in the same term.
    MultipleLeadersInTerm {
        /// The term in which multiple leaders were observed.
        term: u64,
        /// The node IDs of the leaders.
        leaders: Vec<u64>,
    },
    /// Two logs agree on an entry but disagree on an earlier one.
    LogMismatch {
        /// Index of the highest entry both logs agree on.
        agreed_index: u64,
        /// Index of the earlier entry they disagree on.
        index: u64,
        /// The first node ID.
        node_a: u64,
        /// The second node ID.
        node_b: u64,
    },
    /// Committed entry missing from a later leader's log.
    MissingCommittedEntry {
        /// The log index of the missing entry.
        index: u64,
        /// The term of the missing entry.
        term: u64,
        /// The leader node ID that is missing the entry.
        leader_node: u64,
        /// The leader's current term.
        leader_term: u64,
    },
    /// A leader advanced its commit index to an entry of an older term.
    CommittedForeignTerm {
        /// The leader.
        node: u64,
        /// The leader's term.
        term: u64,
        /// The new commit index.
        index: u64,
        /// Term of the entry at that index.
        entry_term: u64,
    },
    /// Two nodes committed different entries at the same index.
    CommittedEntryChanged {
        /// The log index.
        index: u64,
        /// Term first observed as committed.
        term_a: u64,
        /// Term observed later.
        term_b: u64,
    },
}

impl std::fmt::Display for PropertyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MultipleLeadersInTerm { term, leaders } => {
                write!(f, "Multiple leaders in term {term}: {leaders:?}")
            }
            Self::LogMismatch {
                agreed_index,
                index,
                node_a,
                node_b,
            } => {
                write!(
                    f,
                    "Log mismatch at index {index}: nodes {node_a} and {node_b} \
                     agree at index {agreed_index}"
                )
            }
            Self::MissingCommittedEntry {
                index,
                term,
                leader_node,
                leader_term,
            } => {
                write!(
                    f,
                    "Committed entry (index={index}, term={term}) missing from \
                     leader {leader_node} in term {leader_term}"
                )
            }
            Self::CommittedForeignTerm {
                node,
                term,
                index,
                entry_term,
            } => {
                write!(
                    f,
                    "Leader {node} in term {term} committed index {index} of term {entry_term}"
                )
            }
            Self::CommittedEntryChanged {
                index,
                term_a,
                term_b,
            } => {
                write!(
                    f,
                    "Committed entry at index {index} changed from term {term_a} to {term_b}"
                )
            }
        }
    }
}

// ============================================================================
// Property Checker
// ============================================================================

/// A committed entry as first observed.
#[derive(Debug, Clone, Copy)]
struct CommittedEntry {
    term: u64,
    /// Term of the node that observed the commit. The commit happened in
    /// this term or earlier, so every leader of a later term must hold it.
    observed_in: u64,
}

/// Tracks state across a simulation for property verification.
#[derive(Debug, Default)]
pub struct PropertyChecker {
    /// Leaders observed in each term: term -> set of node IDs.
    leaders_by_term: BTreeMap<u64, BTreeSet<u64>>,
    /// Committed entries by index.
    committed_entries: BTreeMap<u64, CommittedEntry>,
    /// Highest commit index recorded per node.
    commit_seen: BTreeMap<u64, u64>,
    /// (term, commit) of each node at the previous observation.
    last_observed: BTreeMap<u64, (u64, u64)>,
    /// Violations found.
    violations: Vec<PropertyViolation>,
}

impl PropertyChecker {
    /// Creates a new property checker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the current state of every live node.
    ///
    /// Call this after each simulation step to track state changes.
    pub fn record_state(&mut self, cluster: &SimCluster) {
        for node in cluster.nodes().filter(|n| !n.is_crashed()) {
            self.record_node(node);
        }
    }

    fn record_node(&mut self, node: &SimNode) {
        let id = node.id().get();
        let term = node.term();
        let commit = node.committed();

        if node.state() == StateRole::Leader {
            self.leaders_by_term.entry(term).or_default().insert(id);

            // Only a leader advances its own commit index within a term.
            if let Some(&(prev_term, prev_commit)) = self.last_observed.get(&id) {
                if prev_term == term && commit > prev_commit {
                    let entry_term = node.term_at(commit);
                    if entry_term != term {
                        self.violations.push(PropertyViolation::CommittedForeignTerm {
                            node: id,
                            term,
                            index: commit,
                            entry_term,
                        });
                    }
                }
            }
        }
        self.last_observed.insert(id, (term, commit));

        let seen = self.commit_seen.entry(id).or_default();
        if commit > *seen {
            for index in (*seen + 1)..=commit {
                let entry_term = node.term_at(index);
                if entry_term == 0 {
                    continue;
                }
                match self.committed_entries.get_mut(&index) {
                    None => {
                        self.committed_entries.insert(
                            index,
                            CommittedEntry {
                                term: entry_term,
                                observed_in: term,
                            },
                        );
                    }
                    Some(existing) if existing.term != entry_term => {
                        self.violations
                            .push(PropertyViolation::CommittedEntryChanged {
                                index,
                                term_a: existing.term,
                                term_b: entry_term,
                            });
                    }
                    Some(existing) => existing.observed_in = existing.observed_in.min(term),
                }
            }
            *seen = commit;
        }
    }

    /// Checks all properties and returns every violation found so far.
    pub fn check_all(&mut self, cluster: &SimCluster) -> Vec<PropertyViolation> {
        self.record_state(cluster);

        let mut violations = self.check_single_leader_per_term();
        violations.extend(self.check_log_matching(cluster));
        violations.extend(self.check_leader_completeness(cluster));
        violations.extend(self.violations.iter().cloned());
        violations
    }

    /// Checks that no term had more than one leader.
    #[must_use]
    pub fn check_single_leader_per_term(&self) -> Vec<PropertyViolation> {
        self.leaders_by_term
            .iter()
            .filter(|(_, leaders)| leaders.len() > 1)
            .map(|(&term, leaders)| PropertyViolation::MultipleLeadersInTerm {
                term,
                leaders: leaders.iter().copied().collect(),
            })
            .collect()
    }

    /// Checks that whenever two logs hold the same (index, term), they
    /// agree on every earlier entry too.
    #[must_use]
    pub fn check_log_matching(&self, cluster: &SimCluster) -> Vec<PropertyViolation> {
        let live: Vec<_> = cluster.nodes().filter(|n| !n.is_crashed()).collect();
        let mut violations = Vec::new();

        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                let last = a.last_index().min(b.last_index());
                let same = |idx| a.term_at(idx) != 0 && a.term_at(idx) == b.term_at(idx);
                let agreed = (1..=last).rev().find(|&idx| same(idx));
                let Some(agreed) = agreed else {
                    continue;
                };
                // Entries folded into a snapshot on either side report term 0.
                if let Some(index) = (1..agreed).find(|&idx| {
                    let (ta, tb) = (a.term_at(idx), b.term_at(idx));
                    ta != 0 && tb != 0 && ta != tb
                }) {
                    violations.push(PropertyViolation::LogMismatch {
                        agreed_index: agreed,
                        index,
                        node_a: a.id().get(),
                        node_b: b.id().get(),
                    });
                }
            }
        }
        violations
    }

    /// Checks that every current leader holds every entry committed before
    /// its term.
    #[must_use]
    pub fn check_leader_completeness(&self, cluster: &SimCluster) -> Vec<PropertyViolation> {
        let mut violations = Vec::new();
        for leader in cluster
            .nodes()
            .filter(|n| !n.is_crashed() && n.state() == StateRole::Leader)
        {
            let leader_term = leader.term();
            for (&index, entry) in &self.committed_entries {
                if entry.observed_in >= leader_term {
                    continue;
                }
                let term = leader.term_at(index);
                let compacted = term == 0 && index < leader.raft().raft_log.first_index();
                if !compacted && term != entry.term {
                    violations.push(PropertyViolation::MissingCommittedEntry {
                        index,
                        term: entry.term,
                        leader_node: leader.id().get(),
                        leader_term,
                    });
                }
            }
        }
        violations
    }

    /// Number of committed entries observed so far.
    #[must_use]
    pub fn committed_count(&self) -> usize {
        self.committed_entries.len()
    }

    /// Number of distinct terms in which a leader was observed.
    #[must_use]
    pub fn terms_with_leader(&self) -> usize {
        self.leaders_by_term.len()
    }
}

/// Asserts that the checker found no violations.
///
/// # Panics
/// Panics listing every violation, tagged with `seed`.
pub fn assert_no_violations(checker: &mut PropertyChecker, cluster: &SimCluster, seed: u64) {
    let violations = checker.check_all(cluster);
    assert!(
        violations.is_empty(),
        "seed {seed}: {}",
        violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    );
}
