//! Applies membership changes to a copy of the tracked configuration.

use std::collections::BTreeSet;

use keel_core::NodeId;

use super::{ConfChangeSingle, ConfChangeType};
use crate::error::{RaftError, RaftResult};
use crate::tracker::{Progress, ProgressMap, ProgressTracker, TrackerConfig};

/// Computes the configuration that results from a set of changes.
///
/// The changer only reads the live tracker. Every operation works on a
/// copy of the configuration and progress map, checks the invariants before
/// and after, and hands the result back; the caller installs it with
/// [`ProgressTracker::apply`] only on success.
#[derive(Debug, Clone, Copy)]
pub struct Changer<'a> {
    tracker: &'a ProgressTracker,
    last_index: u64,
}

impl<'a> Changer<'a> {
    /// Creates a changer over `tracker`. New peers start probing at
    /// `last_index`.
    #[must_use]
    pub const fn new(tracker: &'a ProgressTracker, last_index: u64) -> Self {
        Self {
            tracker,
            last_index,
        }
    }

    /// Enters a joint configuration: the current voters become the outgoing
    /// half and `changes` are applied to the incoming half.
    ///
    /// # Errors
    /// Fails if the configuration is already joint, has no voters, or the
    /// changes leave it invalid.
    pub fn enter_joint(
        &self,
        auto_leave: bool,
        changes: &[ConfChangeSingle],
    ) -> RaftResult<(TrackerConfig, ProgressMap)> {
        let (mut cfg, mut prs) = self.check_and_copy()?;
        if cfg.voters.is_joint() {
            return Err(RaftError::conf_change("config is already joint"));
        }
        if cfg.voters.incoming.is_empty() {
            // Without voters there is no majority to carry into the outgoing half.
            return Err(RaftError::conf_change(
                "can't make a zero-voter config joint",
            ));
        }

        cfg.voters.outgoing = cfg.voters.incoming.clone();
        self.apply(&mut cfg, &mut prs, changes)?;
        cfg.auto_leave = auto_leave;
        check_and_return(cfg, prs)
    }

    /// Leaves a joint configuration: staged learners become learners, the
    /// outgoing half is dropped, and peers that are no longer members lose
    /// their progress.
    ///
    /// # Errors
    /// Fails if the configuration is not joint.
    pub fn leave_joint(&self) -> RaftResult<(TrackerConfig, ProgressMap)> {
        let (mut cfg, mut prs) = self.check_and_copy()?;
        if !cfg.voters.is_joint() {
            return Err(RaftError::conf_change("can't leave a non-joint config"));
        }

        for id in std::mem::take(&mut cfg.learners_next) {
            cfg.learners.insert(id);
            if let Some(pr) = prs.get_mut(&id) {
                pr.is_learner = true;
            }
        }

        for id in cfg.voters.outgoing.iter() {
            let is_voter = cfg.voters.incoming.contains(id);
            let is_learner = cfg.learners.contains(id);
            if !is_voter && !is_learner {
                prs.remove(id);
            }
        }
        cfg.voters.clear_outgoing();
        cfg.auto_leave = false;

        check_and_return(cfg, prs)
    }

    /// Applies changes that alter at most one voter, without joint consensus.
    ///
    /// # Errors
    /// Fails if the configuration is joint, if more than one voter would
    /// change, or if the changes leave the configuration invalid.
    pub fn simple(&self, changes: &[ConfChangeSingle]) -> RaftResult<(TrackerConfig, ProgressMap)> {
        let (mut cfg, mut prs) = self.check_and_copy()?;
        if cfg.voters.is_joint() {
            return Err(RaftError::conf_change(
                "can't apply simple config change in joint config",
            ));
        }
        self.apply(&mut cfg, &mut prs, changes)?;

        let before: &BTreeSet<NodeId> = &self.tracker.config().voters.incoming;
        let after: &BTreeSet<NodeId> = &cfg.voters.incoming;
        if before.symmetric_difference(after).count() > 1 {
            return Err(RaftError::conf_change(
                "more than one voter changed without entering joint config",
            ));
        }

        check_and_return(cfg, prs)
    }

    fn apply(
        &self,
        cfg: &mut TrackerConfig,
        prs: &mut ProgressMap,
        changes: &[ConfChangeSingle],
    ) -> RaftResult<()> {
        for cc in changes {
            if cc.node_id.is_none() {
                // NONE never names a peer.
                continue;
            }
            match cc.change_type {
                ConfChangeType::AddNode => self.make_voter(cfg, prs, cc.node_id),
                ConfChangeType::AddLearnerNode => self.make_learner(cfg, prs, cc.node_id),
                ConfChangeType::RemoveNode => remove(cfg, prs, cc.node_id),
                ConfChangeType::UpdateNode => {
                    // Membership is unaffected by updates.
                    tracing::debug!(node = %cc.node_id, "ignoring update-node conf change");
                }
            }
        }
        if cfg.voters.incoming.is_empty() {
            return Err(RaftError::conf_change("removed all voters"));
        }
        Ok(())
    }

    fn make_voter(&self, cfg: &mut TrackerConfig, prs: &mut ProgressMap, id: NodeId) {
        let Some(pr) = prs.get_mut(&id) else {
            self.init_progress(cfg, prs, id, false);
            return;
        };

        pr.is_learner = false;
        cfg.learners.remove(&id);
        cfg.learners_next.remove(&id);
        cfg.voters.incoming.insert(id);
    }

    /// Demotes or adds a learner.
    ///
    /// A peer that is still an outgoing voter is staged in `learners_next`
    /// rather than marked learner, so that no peer is ever both a voter and
    /// a learner at the same time.
    fn make_learner(&self, cfg: &mut TrackerConfig, prs: &mut ProgressMap, id: NodeId) {
        let Some(pr) = prs.get(&id) else {
            self.init_progress(cfg, prs, id, true);
            return;
        };
        if pr.is_learner {
            return;
        }

        let mut pr = pr.clone();
        // Drop it from the incoming voters (and any learner sets), then
        // put its progress back; remove() may have discarded it.
        remove(cfg, prs, id);

        if cfg.voters.outgoing.contains(&id) {
            cfg.learners_next.insert(id);
        } else {
            pr.is_learner = true;
            cfg.learners.insert(id);
        }
        prs.insert(id, pr);
    }

    fn init_progress(
        &self,
        cfg: &mut TrackerConfig,
        prs: &mut ProgressMap,
        id: NodeId,
        is_learner: bool,
    ) {
        if is_learner {
            cfg.learners.insert(id);
        } else {
            cfg.voters.incoming.insert(id);
        }

        // Probe from the last index: the peer is assumed to be caught up
        // until it says otherwise. It is also considered active so that a
        // quorum check right after the change does not depose the leader.
        let mut pr = Progress::new(
            self.last_index.max(1),
            self.tracker.max_inflight(),
            self.tracker.max_inflight_bytes(),
        );
        pr.is_learner = is_learner;
        pr.recent_active = true;
        prs.insert(id, pr);
    }

    fn check_and_copy(&self) -> RaftResult<(TrackerConfig, ProgressMap)> {
        let cfg = self.tracker.config().clone();
        let prs = self.tracker.progress().clone();
        check_invariants(&cfg, &prs)?;
        Ok((cfg, prs))
    }
}

/// Removes `id` from the incoming voters and both learner sets. Its progress
/// survives while the outgoing half still needs it.
fn remove(cfg: &mut TrackerConfig, prs: &mut ProgressMap, id: NodeId) {
    if !prs.contains_key(&id) {
        return;
    }

    cfg.voters.incoming.remove(&id);
    cfg.learners.remove(&id);
    cfg.learners_next.remove(&id);

    if !cfg.voters.outgoing.contains(&id) {
        prs.remove(&id);
    }
}

fn check_and_return(
    cfg: TrackerConfig,
    prs: ProgressMap,
) -> RaftResult<(TrackerConfig, ProgressMap)> {
    check_invariants(&cfg, &prs)?;
    Ok((cfg, prs))
}

/// Verifies that a configuration and progress map are consistent.
///
/// # Errors
/// Returns a description of the first violated invariant.
pub fn check_invariants(cfg: &TrackerConfig, prs: &ProgressMap) -> RaftResult<()> {
    let all = cfg
        .voters
        .ids()
        .into_iter()
        .chain(cfg.learners.iter().copied())
        .chain(cfg.learners_next.iter().copied());
    for id in all {
        if !prs.contains_key(&id) {
            let msg = format!("no progress for {}", id.get());
            return Err(RaftError::conf_change(msg));
        }
    }

    // Staged learners are still outgoing voters and not yet learners.
    for id in &cfg.learners_next {
        if !cfg.voters.outgoing.contains(id) {
            return Err(RaftError::conf_change(format!(
                "{} is in LearnersNext, but not Voters[1]",
                id.get()
            )));
        }
        if prs.get(id).is_some_and(|pr| pr.is_learner) {
            return Err(RaftError::conf_change(format!(
                "{} is in LearnersNext, but is already marked as learner",
                id.get()
            )));
        }
    }

    // Learners never overlap with voters of either half.
    for id in &cfg.learners {
        if cfg.voters.outgoing.contains(id) {
            return Err(RaftError::conf_change(format!(
                "{} is in Learners and Voters[1]",
                id.get()
            )));
        }
        if cfg.voters.incoming.contains(id) {
            return Err(RaftError::conf_change(format!(
                "{} is in Learners and Voters[0]",
                id.get()
            )));
        }
        if !prs.get(id).is_some_and(|pr| pr.is_learner) {
            return Err(RaftError::conf_change(format!(
                "{} is in Learners, but is not marked as learner",
                id.get()
            )));
        }
    }

    if !cfg.voters.is_joint() {
        if !cfg.learners_next.is_empty() {
            return Err(RaftError::conf_change(
                "cfg.LearnersNext must be nil when not joint",
            ));
        }
        if cfg.auto_leave {
            return Err(RaftError::conf_change(
                "AutoLeave must be false when not joint",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confchange::conf_changes_from_string;

    fn ccs(s: &str) -> Vec<ConfChangeSingle> {
        conf_changes_from_string(s).unwrap()
    }

    fn ids(set: &BTreeSet<NodeId>) -> Vec<u64> {
        set.iter().map(|id| id.get()).collect()
    }

    /// Applies a change to `tracker` the way the state machine does:
    /// compute on a copy, install on success.
    fn simple(tracker: &mut ProgressTracker, last_index: u64, s: &str) -> RaftResult<()> {
        let (cfg, prs) = Changer::new(tracker, last_index).simple(&ccs(s))?;
        tracker.apply(cfg, prs);
        Ok(())
    }

    fn enter_joint(tracker: &mut ProgressTracker, auto_leave: bool, s: &str) -> RaftResult<()> {
        let (cfg, prs) = Changer::new(tracker, 10).enter_joint(auto_leave, &ccs(s))?;
        tracker.apply(cfg, prs);
        Ok(())
    }

    fn leave_joint(tracker: &mut ProgressTracker) -> RaftResult<()> {
        let (cfg, prs) = Changer::new(tracker, 10).leave_joint()?;
        tracker.apply(cfg, prs);
        Ok(())
    }

    fn three_voters() -> ProgressTracker {
        let mut tracker = ProgressTracker::new(256, 0);
        simple(&mut tracker, 0, "v1").unwrap();
        simple(&mut tracker, 0, "v2").unwrap();
        simple(&mut tracker, 0, "v3").unwrap();
        tracker
    }

    #[test]
    fn test_simple_adds_probe_at_last_index() {
        let mut tracker = ProgressTracker::new(256, 0);
        simple(&mut tracker, 5, "v1").unwrap();
        let pr = tracker.get(NodeId::new(1)).unwrap();
        assert_eq!(pr.next_idx, 5);
        assert_eq!(pr.matched, 0);
        assert!(pr.recent_active);

        // An empty log still probes from index 1.
        simple(&mut tracker, 0, "l2").unwrap();
        assert_eq!(tracker.get(NodeId::new(2)).unwrap().next_idx, 1);
        assert!(tracker.get(NodeId::new(2)).unwrap().is_learner);
    }

    #[test]
    fn test_simple_rejects_multiple_voter_changes() {
        let mut tracker = three_voters();
        let err = simple(&mut tracker, 10, "v4 v5").unwrap_err();
        assert!(err.to_string().contains("more than one voter changed"));
        // Live state untouched.
        assert_eq!(ids(&tracker.config().voters.incoming), vec![1, 2, 3]);
        assert!(tracker.get(NodeId::new(4)).is_none());

        // Adding a learner and a voter is fine: only one voter changes.
        simple(&mut tracker, 10, "v4 l5").unwrap();
        assert_eq!(ids(&tracker.config().voters.incoming), vec![1, 2, 3, 4]);
        assert_eq!(ids(&tracker.config().learners), vec![5]);
    }

    #[test]
    fn test_simple_promote_and_demote() {
        let mut tracker = three_voters();
        simple(&mut tracker, 10, "l4").unwrap();
        simple(&mut tracker, 10, "v4").unwrap();
        assert_eq!(ids(&tracker.config().voters.incoming), vec![1, 2, 3, 4]);
        assert!(tracker.config().learners.is_empty());
        assert!(!tracker.get(NodeId::new(4)).unwrap().is_learner);

        simple(&mut tracker, 10, "l3").unwrap();
        assert_eq!(ids(&tracker.config().voters.incoming), vec![1, 2, 4]);
        assert_eq!(ids(&tracker.config().learners), vec![3]);
        assert!(tracker.get(NodeId::new(3)).unwrap().is_learner);
    }

    #[test]
    fn test_simple_cannot_remove_all_voters() {
        let mut tracker = ProgressTracker::new(256, 0);
        simple(&mut tracker, 0, "v1").unwrap();
        let err = simple(&mut tracker, 0, "r1").unwrap_err();
        assert!(err.to_string().contains("removed all voters"));
    }

    #[test]
    fn test_zero_id_and_update_are_ignored() {
        let mut tracker = three_voters();
        simple(&mut tracker, 10, "v0 u2").unwrap();
        assert_eq!(ids(&tracker.config().voters.incoming), vec![1, 2, 3]);
        assert!(tracker.get(NodeId::NONE).is_none());
    }

    #[test]
    fn test_enter_joint_then_leave_drops_removed_progress() {
        let mut tracker = three_voters();
        enter_joint(&mut tracker, false, "r3").unwrap();
        assert_eq!(ids(&tracker.config().voters.incoming), vec![1, 2]);
        assert_eq!(ids(&tracker.config().voters.outgoing), vec![1, 2, 3]);
        // Still needed by the outgoing half.
        assert!(tracker.get(NodeId::new(3)).is_some());

        leave_joint(&mut tracker).unwrap();
        assert_eq!(ids(&tracker.config().voters.incoming), vec![1, 2]);
        assert!(tracker.config().voters.outgoing.is_empty());
        assert!(tracker.get(NodeId::new(3)).is_none());
    }

    #[test]
    fn test_enter_joint_errors() {
        let mut tracker = ProgressTracker::new(256, 0);
        let err = enter_joint(&mut tracker, false, "v1").unwrap_err();
        assert!(err.to_string().contains("zero-voter"));

        let mut tracker = three_voters();
        enter_joint(&mut tracker, true, "v4").unwrap();
        assert!(tracker.config().auto_leave);
        let err = enter_joint(&mut tracker, false, "v5").unwrap_err();
        assert!(err.to_string().contains("already joint"));

        let err = simple(&mut tracker, 10, "v5").unwrap_err();
        assert!(err.to_string().contains("in joint config"));
    }

    #[test]
    fn test_leave_non_joint_fails() {
        let mut tracker = three_voters();
        let err = leave_joint(&mut tracker).unwrap_err();
        assert!(err.to_string().contains("non-joint"));
    }

    #[test]
    fn test_demoting_outgoing_voter_stages_learner() {
        let mut tracker = three_voters();
        enter_joint(&mut tracker, true, "l3").unwrap();
        let cfg = tracker.config();
        assert_eq!(ids(&cfg.voters.incoming), vec![1, 2]);
        assert_eq!(ids(&cfg.voters.outgoing), vec![1, 2, 3]);
        assert_eq!(ids(&cfg.learners_next), vec![3]);
        assert!(cfg.learners.is_empty());
        assert!(!tracker.get(NodeId::new(3)).unwrap().is_learner);

        leave_joint(&mut tracker).unwrap();
        let cfg = tracker.config();
        assert_eq!(ids(&cfg.learners), vec![3]);
        assert!(cfg.learners_next.is_empty());
        assert!(!cfg.auto_leave);
        assert!(tracker.get(NodeId::new(3)).unwrap().is_learner);
    }

    #[test]
    fn test_joint_round_trip_is_identity() {
        let mut tracker = three_voters();
        let before = tracker.config().clone();
        enter_joint(&mut tracker, false, "").unwrap();
        assert!(tracker.config().voters.is_joint());
        leave_joint(&mut tracker).unwrap();
        assert_eq!(tracker.config(), &before);
    }

    #[test]
    fn test_check_invariants_catches_overlap() {
        let tracker = three_voters();
        let mut cfg = tracker.config().clone();
        let prs = tracker.progress().clone();
        cfg.learners.insert(NodeId::new(1));
        let err = check_invariants(&cfg, &prs).unwrap_err();
        assert!(err.to_string().contains("1 is in Learners and Voters[0]"));

        let mut cfg = tracker.config().clone();
        cfg.auto_leave = true;
        let err = check_invariants(&cfg, &prs).unwrap_err();
        assert!(err.to_string().contains("AutoLeave must be false"));

        let mut cfg = tracker.config().clone();
        cfg.voters.incoming.insert(NodeId::new(9));
        let err = check_invariants(&cfg, &prs).unwrap_err();
        assert!(err.to_string().contains("no progress for 9"));
    }
}
