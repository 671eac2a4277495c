//! Rebuilds a tracked configuration from its flat description.

use keel_core::NodeId;

use super::{Changer, ConfChangeSingle, ConfChangeType};
use crate::error::RaftResult;
use crate::message::ConfState;
use crate::tracker::{ProgressMap, ProgressTracker, TrackerConfig};

/// Splits a [`ConfState`] into the changes that build its outgoing half and
/// the changes that then turn it into the incoming half.
fn to_conf_change_single(cs: &ConfState) -> (Vec<ConfChangeSingle>, Vec<ConfChangeSingle>) {
    let change = |change_type, node_id: &NodeId| ConfChangeSingle {
        change_type,
        node_id: *node_id,
    };

    let outgoing: Vec<_> = cs
        .voters_outgoing
        .iter()
        .map(|id| change(ConfChangeType::AddNode, id))
        .collect();

    // Starting from the outgoing config, remove every voter and add back
    // the incoming ones. Learners-next are added as learners; since they
    // are still outgoing voters, they get staged rather than demoted.
    let incoming = cs
        .voters_outgoing
        .iter()
        .map(|id| change(ConfChangeType::RemoveNode, id))
        .chain(
            cs.voters
                .iter()
                .map(|id| change(ConfChangeType::AddNode, id)),
        )
        .chain(
            cs.learners
                .iter()
                .map(|id| change(ConfChangeType::AddLearnerNode, id)),
        )
        .chain(
            cs.learners_next
                .iter()
                .map(|id| change(ConfChangeType::AddLearnerNode, id)),
        )
        .collect();

    (outgoing, incoming)
}

/// Reconstructs the configuration described by `cs`, starting from the
/// (normally empty) configuration in `tracker`.
///
/// The target is reached through the same operations live membership
/// changes use: the outgoing half is built one voter at a time, then a joint
/// configuration is entered with the incoming changes. A non-joint state is
/// built with simple changes alone. Every intermediate configuration must
/// satisfy the invariants, which proves the target is reachable.
///
/// # Errors
/// Fails if the description does not correspond to a valid configuration.
pub fn restore(
    tracker: &ProgressTracker,
    last_index: u64,
    cs: &ConfState,
) -> RaftResult<(TrackerConfig, ProgressMap)> {
    let (outgoing, incoming) = to_conf_change_single(cs);
    let mut scratch = tracker.clone();

    if outgoing.is_empty() {
        for cc in &incoming {
            let (cfg, prs) = Changer::new(&scratch, last_index).simple(std::slice::from_ref(cc))?;
            scratch.apply(cfg, prs);
        }
    } else {
        for cc in &outgoing {
            let (cfg, prs) = Changer::new(&scratch, last_index).simple(std::slice::from_ref(cc))?;
            scratch.apply(cfg, prs);
        }
        let (cfg, prs) =
            Changer::new(&scratch, last_index).enter_joint(cs.auto_leave, &incoming)?;
        scratch.apply(cfg, prs);
    }

    Ok((scratch.config().clone(), scratch.progress().clone()))
}
