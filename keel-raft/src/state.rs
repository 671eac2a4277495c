//! The per-replica consensus state machine.
//!
//! [`Raft`] is a pure state machine: it consumes messages and ticks and
//! accumulates outbound messages, log writes and read states for the driver.
//! It never performs I/O. This module holds the state and the role
//! transitions; message dispatch lives in `step.rs`.
//!
//! # Invariants
//!
//! - `term` never decreases; `vote` is only meaningful within `term`
//! - a replica only becomes leader from `Candidate`
//! - messages that acknowledge persisted state (`AppResp`, `VoteResp`,
//!   `PreVoteResp`) are held in `msgs_after_append` until the driver has
//!   persisted what they acknowledge

use std::fmt;

use bytes::Bytes;
use keel_core::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::confchange::{self, Changer, ConfChange};
use crate::config::RaftConfig;
use crate::error::RaftResult;
use crate::log::RaftLog;
use crate::message::{payloads_size, ConfState, Entry, HardState, Message, MessageType, Snapshot};
use crate::read_only::{request_ctx, ReadOnly, ReadState};
use crate::storage::{RaftState, Storage};
use crate::tracker::{Progress, ProgressMap, ProgressState, ProgressTracker, TrackerConfig};

/// Role of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StateRole {
    /// Follows a leader, or waits for one to appear.
    #[default]
    Follower,
    /// Campaigning for leadership at an incremented term.
    Candidate,
    /// Leads the group for its term.
    Leader,
    /// Polling for a pre-vote without incrementing the term.
    PreCandidate,
}

impl fmt::Display for StateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Follower => "StateFollower",
            Self::Candidate => "StateCandidate",
            Self::Leader => "StateLeader",
            Self::PreCandidate => "StatePreCandidate",
        };
        f.write_str(name)
    }
}

/// Volatile state useful for logging and debugging. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftState {
    /// Known leader, or `NONE`.
    pub lead: NodeId,
    /// Current role.
    pub raft_state: StateRole,
}

/// Why a campaign is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CampaignType {
    /// First phase of an election when pre-vote is enabled.
    PreElection,
    /// A normal, timer-driven election.
    Election,
    /// An election forced by a leadership transfer.
    Transfer,
}

/// Context attached to vote requests of a forced election. Such requests
/// bypass the leader lease check of receivers.
pub(crate) const CAMPAIGN_TRANSFER: &[u8] = b"CampaignTransfer";

/// A Raft replica.
pub struct Raft<S: Storage> {
    /// This replica's ID.
    pub id: NodeId,
    /// Current term.
    pub term: u64,
    /// Who this replica voted for in `term`, or `NONE`.
    pub vote: NodeId,
    /// Reads served but not yet handed to the application.
    pub read_states: Vec<ReadState>,
    /// The log.
    pub raft_log: RaftLog<S>,
    /// Current role.
    pub state: StateRole,
    /// Known leader, or `NONE`.
    pub lead: NodeId,
    /// Target of an in-progress leadership transfer, or `NONE`.
    pub lead_transferee: NodeId,
    /// Index of the newest conf change that may still be unapplied. Only
    /// one conf change may be pending at a time; new ones are accepted once
    /// the applied index reaches this.
    pub pending_conf_index: u64,
    /// Messages to send right away. Never addressed to this replica.
    pub msgs: Vec<Message>,
    /// Messages to send once the current unstable state is durable. May be
    /// addressed to this replica.
    pub msgs_after_append: Vec<Message>,

    pub(crate) tracker: ProgressTracker,
    pub(crate) read_only: ReadOnly,
    /// `ReadIndex` requests received before this leader committed an entry
    /// of its own term.
    pub(crate) pending_read_index_messages: Vec<Message>,

    is_learner: bool,
    max_msg_size: u64,
    max_uncommitted_size: u64,
    /// Estimated size of the uncommitted tail. Leader only; reset on term
    /// change.
    uncommitted_size: u64,

    /// Ticks since the last election timeout (leader, candidate) or since
    /// hearing from the leader (follower).
    pub(crate) election_elapsed: usize,
    /// Ticks since the last heartbeat. Leader only.
    heartbeat_elapsed: usize,
    heartbeat_timeout: usize,
    election_timeout: usize,
    /// Uniform in `[election_timeout, 2 * election_timeout)`; redrawn on
    /// every reset.
    randomized_election_timeout: usize,

    pub(crate) check_quorum: bool,
    pub(crate) pre_vote: bool,
    pub(crate) disable_proposal_forwarding: bool,
    pub(crate) disable_conf_change_validation: bool,
    step_down_on_removal: bool,

    rng: StdRng,
}

impl<S: Storage> Raft<S> {
    /// Creates a replica over `store`, recovering term, vote, commit index
    /// and membership from it.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the initial state
    /// cannot be read, or the stored membership cannot be restored.
    ///
    /// # Panics
    /// Panics if the stored state is inconsistent with the log.
    pub fn new(config: &RaftConfig, store: S) -> RaftResult<Self> {
        config.validate()?;

        let raft_log = RaftLog::new(store, config.committed_size_per_ready_limit());
        let RaftState {
            hard_state,
            conf_state,
        } = raft_log.store.initial_state()?;

        let seed = config.random_seed.unwrap_or_else(|| config.id.get());
        let mut raft = Self {
            id: config.id,
            term: 0,
            vote: NodeId::NONE,
            read_states: Vec::new(),
            raft_log,
            state: StateRole::Follower,
            lead: NodeId::NONE,
            lead_transferee: NodeId::NONE,
            pending_conf_index: 0,
            msgs: Vec::new(),
            msgs_after_append: Vec::new(),
            tracker: ProgressTracker::new(config.max_inflight_msgs, config.inflight_bytes_limit()),
            read_only: ReadOnly::new(config.read_only_option),
            pending_read_index_messages: Vec::new(),
            is_learner: false,
            max_msg_size: config.max_size_per_msg,
            max_uncommitted_size: config.uncommitted_size_limit(),
            uncommitted_size: 0,
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            heartbeat_timeout: config.heartbeat_tick,
            election_timeout: config.election_tick,
            randomized_election_timeout: config.election_tick,
            check_quorum: config.check_quorum,
            pre_vote: config.pre_vote,
            disable_proposal_forwarding: config.disable_proposal_forwarding,
            disable_conf_change_validation: config.disable_conf_change_validation,
            step_down_on_removal: config.step_down_on_removal,
            rng: StdRng::seed_from_u64(seed),
        };

        let (cfg, prs) =
            confchange::restore(&raft.tracker, raft.raft_log.last_index(), &conf_state)?;
        let restored = raft.switch_to_config(cfg, prs);
        assert_equivalent(&conf_state, &restored);

        if !hard_state.is_empty() {
            raft.load_state(&hard_state);
        }
        if config.applied > 0 {
            raft.raft_log.applied_to(config.applied, 0);
        }
        raft.become_follower(raft.term, NodeId::NONE);

        info!(
            raft_id = %raft.id,
            peers = ?raft.tracker.voter_nodes(),
            term = raft.term,
            commit = raft.raft_log.committed,
            applied = raft.raft_log.applied,
            last_index = raft.raft_log.last_index(),
            last_term = raft.raft_log.last_term(),
            "new raft"
        );
        Ok(raft)
    }

    /// Progress tracker: membership and per-peer replication state.
    #[must_use]
    pub const fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Pending read-index requests.
    #[must_use]
    pub const fn read_only(&self) -> &ReadOnly {
        &self.read_only
    }

    /// Returns true if this replica is a learner.
    #[must_use]
    pub const fn is_learner(&self) -> bool {
        self.is_learner
    }

    /// Estimated size of the leader's uncommitted tail.
    #[must_use]
    pub const fn uncommitted_size(&self) -> u64 {
        self.uncommitted_size
    }

    /// Ticks since the election timer was last reset.
    #[must_use]
    pub const fn election_elapsed(&self) -> usize {
        self.election_elapsed
    }

    /// Base election timeout in ticks.
    #[must_use]
    pub const fn election_timeout(&self) -> usize {
        self.election_timeout
    }

    /// Current randomized election timeout in ticks.
    #[must_use]
    pub const fn randomized_election_timeout(&self) -> usize {
        self.randomized_election_timeout
    }

    /// Overrides the randomized election timeout until the next reset.
    /// Meant for tests and simulations that need a fixed schedule.
    pub fn set_randomized_election_timeout(&mut self, timeout: usize) {
        assert!(
            timeout >= self.election_timeout,
            "randomized election timeout {timeout} below election timeout {}",
            self.election_timeout
        );
        self.randomized_election_timeout = timeout;
    }

    /// Returns true if a leader is known.
    #[must_use]
    pub const fn has_leader(&self) -> bool {
        !self.lead.is_none()
    }

    /// Current soft state.
    #[must_use]
    pub const fn soft_state(&self) -> SoftState {
        SoftState {
            lead: self.lead,
            raft_state: self.state,
        }
    }

    /// Current hard state.
    #[must_use]
    pub const fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            vote: self.vote,
            commit: self.raft_log.committed,
        }
    }

    /// Queues a message for sending, filling in `from` and `term`.
    ///
    /// # Panics
    /// Panics if the term is set (or missing) contrary to the message type,
    /// or if a message that is sent immediately is addressed to this
    /// replica.
    pub(crate) fn send(&mut self, mut m: Message) {
        if m.from.is_none() {
            m.from = self.id;
        }
        match m.msg_type {
            MessageType::Vote
            | MessageType::VoteResp
            | MessageType::PreVote
            | MessageType::PreVoteResp => {
                // Campaign messages carry the term they campaign for (or
                // grant), which may differ from ours.
                assert!(
                    m.term != 0,
                    "term should be set when sending {:?}",
                    m.msg_type
                );
            }
            _ => {
                assert!(
                    m.term == 0,
                    "term should not be set when sending {:?} (was {})",
                    m.msg_type,
                    m.term
                );
                // Proposals and read requests are forwarded to the leader
                // and are treated as local there.
                if !matches!(m.msg_type, MessageType::Prop | MessageType::ReadIndex) {
                    m.term = self.term;
                }
            }
        }

        if matches!(
            m.msg_type,
            MessageType::AppResp | MessageType::VoteResp | MessageType::PreVoteResp
        ) {
            // These acknowledge votes and log appends, which must be durable
            // before anyone hears about them.
            self.msgs_after_append.push(m);
        } else {
            assert!(
                m.to != self.id,
                "message should not be self-addressed when sending {:?}",
                m.msg_type
            );
            self.msgs.push(m);
        }
    }

    /// Sends an append (or a snapshot) to `to`, even if it carries no
    /// entries.
    pub(crate) fn send_append(&mut self, to: NodeId) {
        self.maybe_send_append(to, true);
    }

    /// Sends an append with new entries to `to` if its progress allows.
    /// With `send_if_empty`, an empty append is sent to convey the commit
    /// index or probe the peer.
    ///
    /// Returns true if a message was sent.
    pub(crate) fn maybe_send_append(&mut self, to: NodeId, send_if_empty: bool) -> bool {
        let Some(pr) = self.tracker.get(to) else {
            return false;
        };
        if pr.is_paused() {
            return false;
        }

        let prev_index = pr.next_idx - 1;
        let next_index = pr.next_idx;
        let prev_term = self.raft_log.term(prev_index);
        let entries = if pr.state != ProgressState::Replicate || !pr.inflights.full() {
            self.raft_log.entries(next_index, self.max_msg_size)
        } else {
            Ok(Vec::new())
        };

        if entries.as_ref().map_or(true, Vec::is_empty) && !send_if_empty {
            return false;
        }

        let (Ok(prev_term), Ok(entries)) = (prev_term, entries) else {
            // The entries (or the term before them) were compacted away.
            return self.maybe_send_snapshot(to);
        };

        if let Some(pr) = self.tracker.get_mut(to) {
            pr.update_on_entries_send(entries.len(), payloads_size(&entries), next_index);
        }
        let mut m = Message::new(MessageType::App, NodeId::NONE, to);
        m.index = prev_index;
        m.log_term = prev_term;
        m.entries = entries;
        m.commit = self.raft_log.committed;
        self.send(m);
        true
    }

    fn maybe_send_snapshot(&mut self, to: NodeId) -> bool {
        let Some(pr) = self.tracker.get(to) else {
            return false;
        };
        if !pr.recent_active {
            debug!(
                raft_id = %self.id,
                to = %to,
                "ignore sending snapshot since it is not recently active"
            );
            return false;
        }

        let snapshot = match self.raft_log.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_retryable() => {
                debug!(
                    raft_id = %self.id,
                    to = %to,
                    error = %e,
                    "failed to send snapshot; will retry"
                );
                return false;
            }
            Err(e) => panic!("{} unexpected error getting snapshot ({e})", self.id),
        };
        assert!(!snapshot.is_empty(), "need non-empty snapshot");

        let (index, term) = (snapshot.metadata.index, snapshot.metadata.term);
        debug!(
            raft_id = %self.id,
            first_index = self.raft_log.first_index(),
            commit = self.raft_log.committed,
            index,
            term,
            to = %to,
            "sent snapshot"
        );
        if let Some(pr) = self.tracker.get_mut(to) {
            pr.become_snapshot(index);
            debug!(
                raft_id = %self.id,
                to = %to,
                progress = %pr,
                "paused sending replication messages"
            );
        }

        let mut m = Message::new(MessageType::Snap, NodeId::NONE, to);
        m.snapshot = Some(snapshot);
        self.send(m);
        true
    }

    /// Sends a heartbeat to `to` carrying `ctx`.
    pub(crate) fn send_heartbeat(&mut self, to: NodeId, ctx: Bytes) {
        // Never advance a follower's commit past what it is known to hold.
        let matched = self.tracker.get(to).map_or(0, |pr| pr.matched);
        let mut m = Message::new(MessageType::Heartbeat, NodeId::NONE, to);
        m.commit = matched.min(self.raft_log.committed);
        m.context = ctx;
        self.send(m);
    }

    fn peers(&self) -> Vec<NodeId> {
        self.tracker
            .progress()
            .keys()
            .copied()
            .filter(|&id| id != self.id)
            .collect()
    }

    /// Sends appends to every peer.
    pub(crate) fn bcast_append(&mut self) {
        for id in self.peers() {
            self.send_append(id);
        }
    }

    /// Sends heartbeats to every peer, carrying the newest pending read
    /// request's context.
    pub(crate) fn bcast_heartbeat(&mut self) {
        let ctx = self.read_only.last_pending_request_ctx();
        self.bcast_heartbeat_with_ctx(&ctx);
    }

    pub(crate) fn bcast_heartbeat_with_ctx(&mut self, ctx: &Bytes) {
        for id in self.peers() {
            self.send_heartbeat(id, ctx.clone());
        }
    }

    /// Records that entries up to `index` (totalling `size` bytes) were
    /// applied. A leader in an auto-leave joint configuration proposes
    /// leaving it once the configuration change is applied.
    pub(crate) fn applied_to(&mut self, index: u64, size: u64) {
        let new_applied = index.max(self.raft_log.applied);
        self.raft_log.applied_to(new_applied, size);

        if self.tracker.config().auto_leave
            && new_applied >= self.pending_conf_index
            && self.state == StateRole::Leader
        {
            // Leaving is proposed like any other conf change so that it goes
            // through the same validation.
            let mut m = Message::new(MessageType::Prop, NodeId::NONE, NodeId::NONE);
            m.entries = vec![ConfChange::leave().to_entry()];
            match self.step(m) {
                Ok(()) => info!(
                    raft_id = %self.id,
                    config = %self.tracker.config(),
                    "initiating automatic transition out of joint configuration"
                ),
                Err(e) => debug!(
                    raft_id = %self.id,
                    config = %self.tracker.config(),
                    error = %e,
                    "not initiating automatic transition out of joint configuration"
                ),
            }
        }
    }

    pub(crate) fn applied_snap(&mut self, snapshot: &Snapshot) {
        let index = snapshot.metadata.index;
        self.raft_log.stable_snap_to(index);
        self.applied_to(index, 0);
    }

    /// Advances the commit index to what a quorum has replicated, if that
    /// entry belongs to the current term.
    pub(crate) fn maybe_commit(&mut self) -> bool {
        let committed = self.tracker.committed();
        self.raft_log.maybe_commit(committed, self.term)
    }

    /// Resets per-term state, moving to `term`.
    pub(crate) fn reset(&mut self, term: u64) {
        if self.term != term {
            self.term = term;
            self.vote = NodeId::NONE;
        }
        self.lead = NodeId::NONE;

        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();

        self.abort_leader_transfer();

        self.tracker.reset_votes();
        let last_index = self.raft_log.last_index();
        let max_inflight = self.tracker.max_inflight();
        let max_inflight_bytes = self.tracker.max_inflight_bytes();
        let id = self.id;
        for (&peer, pr) in self.tracker.progress_mut().iter_mut() {
            let is_learner = pr.is_learner;
            *pr = Progress::new(last_index + 1, max_inflight, max_inflight_bytes);
            pr.is_learner = is_learner;
            if peer == id {
                pr.matched = last_index;
            }
        }

        self.pending_conf_index = 0;
        self.uncommitted_size = 0;
        self.read_only = ReadOnly::new(self.read_only.option());
    }

    /// Appends proposals to the leader's log, assigning term and index.
    ///
    /// Returns false if the uncommitted budget would be exceeded.
    pub(crate) fn append_entry(&mut self, mut entries: Vec<Entry>) -> bool {
        let last_index = self.raft_log.last_index();
        for (i, e) in entries.iter_mut().enumerate() {
            e.term = self.term;
            e.index = last_index + 1 + i as u64;
        }
        if !self.increase_uncommitted_size(&entries) {
            warn!(
                raft_id = %self.id,
                "appending new entries would exceed the uncommitted size limit; dropping proposal"
            );
            return false;
        }

        let last_index = self.raft_log.append(&entries);
        // The leader acknowledges its own append once it is durable, like
        // any follower.
        let mut m = Message::new(MessageType::AppResp, NodeId::NONE, self.id);
        m.index = last_index;
        self.send(m);
        true
    }

    /// Advances timers by one tick.
    pub fn tick(&mut self) {
        match self.state {
            StateRole::Leader => self.tick_heartbeat(),
            StateRole::Follower | StateRole::Candidate | StateRole::PreCandidate => {
                self.tick_election();
            }
        }
    }

    /// Advances only the election timer. Used while the group is quiesced.
    pub(crate) fn tick_quiesced(&mut self) {
        self.election_elapsed += 1;
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;

        if self.promotable() && self.past_election_timeout() {
            self.election_elapsed = 0;
            let m = Message::new(MessageType::Hup, self.id, NodeId::NONE);
            if let Err(e) = self.step(m) {
                debug!(raft_id = %self.id, error = %e, "error occurred during election");
            }
        }
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        self.election_elapsed += 1;

        if self.election_elapsed >= self.election_timeout {
            self.election_elapsed = 0;
            if self.check_quorum {
                let m = Message::new(MessageType::CheckQuorum, self.id, NodeId::NONE);
                if let Err(e) = self.step(m) {
                    debug!(raft_id = %self.id, error = %e, "error occurred during checking quorum");
                }
            }
            // A transfer that has not completed within an election timeout
            // is abandoned.
            if self.state == StateRole::Leader && !self.lead_transferee.is_none() {
                self.abort_leader_transfer();
            }
        }

        if self.state != StateRole::Leader {
            return;
        }

        if self.heartbeat_elapsed >= self.heartbeat_timeout {
            self.heartbeat_elapsed = 0;
            let m = Message::new(MessageType::Beat, self.id, NodeId::NONE);
            if let Err(e) = self.step(m) {
                debug!(raft_id = %self.id, error = %e, "error occurred during sending heartbeat");
            }
        }
    }

    /// Becomes a follower at `term`, following `lead` (may be `NONE`).
    pub fn become_follower(&mut self, term: u64, lead: NodeId) {
        self.reset(term);
        self.lead = lead;
        self.state = StateRole::Follower;
        info!(raft_id = %self.id, term = self.term, "became follower");
    }

    /// Becomes a candidate at the next term, voting for itself.
    ///
    /// # Panics
    /// Panics if called on a leader.
    pub fn become_candidate(&mut self) {
        assert!(
            self.state != StateRole::Leader,
            "invalid transition [leader -> candidate]"
        );
        self.reset(self.term + 1);
        self.vote = self.id;
        self.state = StateRole::Candidate;
        info!(raft_id = %self.id, term = self.term, "became candidate");
    }

    /// Becomes a pre-candidate. Neither the term nor the vote change.
    ///
    /// # Panics
    /// Panics if called on a leader.
    pub fn become_pre_candidate(&mut self) {
        assert!(
            self.state != StateRole::Leader,
            "invalid transition [leader -> pre-candidate]"
        );
        self.tracker.reset_votes();
        self.lead = NodeId::NONE;
        self.state = StateRole::PreCandidate;
        info!(raft_id = %self.id, term = self.term, "became pre-candidate");
    }

    /// Becomes leader of the current term and appends an empty entry so
    /// that entries of earlier terms can be committed.
    ///
    /// # Panics
    /// Panics if called on a follower.
    pub fn become_leader(&mut self) {
        assert!(
            self.state != StateRole::Follower,
            "invalid transition [follower -> leader]"
        );
        self.reset(self.term);
        self.lead = self.id;
        self.state = StateRole::Leader;

        if let Some(pr) = self.tracker.get_mut(self.id) {
            // The leader's own log is trivially up to date.
            pr.become_replicate();
            pr.recent_active = true;
        }

        // Any conf change in the uncommitted tail may still be pending;
        // refuse new ones until everything up to here is applied.
        self.pending_conf_index = self.raft_log.last_index();

        assert!(
            self.append_entry(vec![Entry::default()]),
            "empty entry was dropped"
        );
        info!(raft_id = %self.id, term = self.term, "became leader");
    }

    pub(crate) fn hup(&mut self, campaign: CampaignType) {
        if self.state == StateRole::Leader {
            debug!(raft_id = %self.id, "ignoring Hup because already leader");
            return;
        }
        if !self.promotable() {
            warn!(raft_id = %self.id, "is unpromotable and can not campaign");
            return;
        }
        if self.has_unapplied_conf_changes() {
            warn!(
                raft_id = %self.id,
                term = self.term,
                "cannot campaign since there are still pending configuration changes to apply"
            );
            return;
        }

        info!(raft_id = %self.id, term = self.term, "starting a new election");
        self.campaign(campaign);
    }

    /// Returns true if committed but unapplied entries contain a conf
    /// change. Campaigning is refused until they are applied, since the
    /// membership that elects this replica must be the current one.
    fn has_unapplied_conf_changes(&self) -> bool {
        let log = &self.raft_log;
        if log.applied >= log.committed {
            return false;
        }

        let hi = log.committed + 1;
        let mut lo = log.applied + 1;
        while lo < hi {
            let page = match log.slice(lo, hi, log.max_applying_ents_size()) {
                Ok(page) => page,
                Err(e) => panic!("error scanning unapplied entries [{lo}, {hi}): {e}"),
            };
            if page.is_empty() {
                break;
            }
            if page.iter().any(Entry::is_conf_change) {
                return true;
            }
            lo += page.len() as u64;
        }
        false
    }

    pub(crate) fn campaign(&mut self, campaign: CampaignType) {
        if !self.promotable() {
            // Callers check this; campaigning anyway is harmless but odd.
            warn!(raft_id = %self.id, "is unpromotable; campaign() should not have been called");
        }

        let (vote_msg, term) = if campaign == CampaignType::PreElection {
            self.become_pre_candidate();
            // Pre-votes are requested for the term we would campaign at,
            // without moving to it.
            (MessageType::PreVote, self.term + 1)
        } else {
            self.become_candidate();
            (MessageType::Vote, self.term)
        };

        let last_index = self.raft_log.last_index();
        let last_term = self.raft_log.last_term();
        let voters = self.tracker.config().voters.ids();
        for id in voters {
            if id == self.id {
                // The self-vote is cast once our own term and vote are
                // durable, like every other vote response.
                let mut m = Message::new(vote_msg.vote_response(), NodeId::NONE, id);
                m.term = term;
                self.send(m);
                continue;
            }

            info!(
                raft_id = %self.id,
                log_term = last_term,
                index = last_index,
                msg_type = ?vote_msg,
                to = %id,
                term = self.term,
                "sent vote request"
            );
            let mut m = Message::new(vote_msg, NodeId::NONE, id);
            m.term = term;
            m.index = last_index;
            m.log_term = last_term;
            if campaign == CampaignType::Transfer {
                m.context = Bytes::from_static(CAMPAIGN_TRANSFER);
            }
            self.send(m);
        }
    }

    /// Records a vote and tallies the campaign so far.
    pub(crate) fn poll(
        &mut self,
        id: NodeId,
        msg_type: MessageType,
        granted: bool,
    ) -> (usize, usize, crate::quorum::VoteResult) {
        if granted {
            info!(
                raft_id = %self.id,
                from = %id,
                msg_type = ?msg_type,
                term = self.term,
                "received vote"
            );
        } else {
            info!(
                raft_id = %self.id,
                from = %id,
                msg_type = ?msg_type,
                term = self.term,
                "received vote rejection"
            );
        }
        self.tracker.record_vote(id, granted);
        self.tracker.tally_votes()
    }

    /// Returns true if this replica may campaign: it is a tracked voter and
    /// is not installing a snapshot.
    #[must_use]
    pub fn promotable(&self) -> bool {
        self.tracker.get(self.id).is_some_and(|pr| !pr.is_learner)
            && !self.raft_log.has_next_or_in_progress_snapshot()
    }

    /// Applies a configuration change to the tracker and returns the new
    /// membership.
    ///
    /// The change is computed on a copy; on error the live configuration is
    /// untouched.
    ///
    /// # Errors
    /// Returns `ConfChange` if the change is invalid for the current
    /// configuration.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> RaftResult<ConfState> {
        let (cfg, prs) = {
            let changer = Changer::new(&self.tracker, self.raft_log.last_index());
            if cc.leave_joint() {
                changer.leave_joint()?
            } else if let Some(auto_leave) = cc.enter_joint() {
                changer.enter_joint(auto_leave, &cc.changes())?
            } else {
                changer.simple(&cc.changes())?
            }
        };
        Ok(self.switch_to_config(cfg, prs))
    }

    /// Installs a new configuration and reacts to it: a removed or demoted
    /// leader may step down, and a leader re-evaluates its commit index
    /// since the quorum may have changed.
    pub(crate) fn switch_to_config(&mut self, cfg: TrackerConfig, prs: ProgressMap) -> ConfState {
        self.tracker.apply(cfg, prs);
        info!(raft_id = %self.id, config = %self.tracker.config(), "switched to configuration");

        let cs = self.tracker.conf_state();
        let own = self.tracker.get(self.id).map(|pr| pr.is_learner);
        self.is_learner = own == Some(true);

        if (own.is_none() || self.is_learner) && self.state == StateRole::Leader {
            // The leader keeps going until the change that removed it is
            // committed and applied, unless configured otherwise.
            if self.step_down_on_removal {
                self.become_follower(self.term, NodeId::NONE);
            }
            return cs;
        }

        if self.state != StateRole::Leader || cs.voters.is_empty() {
            return cs;
        }

        if self.maybe_commit() {
            self.bcast_append();
        } else {
            // Probe newly added peers right away instead of waiting for the
            // next heartbeat.
            for id in self.peers() {
                self.maybe_send_append(id, false);
            }
        }

        if !self.lead_transferee.is_none()
            && !self.tracker.config().voters.contains(self.lead_transferee)
        {
            self.abort_leader_transfer();
        }
        cs
    }

    /// Installs a snapshot received from the leader.
    ///
    /// Returns false if the snapshot was ignored, either because it is not
    /// newer than the commit index or because the log already contains its
    /// last entry (the commit index is fast-forwarded then).
    ///
    /// # Panics
    /// Panics if the snapshot's membership cannot be restored or the
    /// restored configuration does not match it.
    pub(crate) fn restore(&mut self, snapshot: Snapshot) -> bool {
        let (index, term) = (snapshot.metadata.index, snapshot.metadata.term);
        if index <= self.raft_log.committed {
            return false;
        }
        if self.state != StateRole::Follower {
            // A leader or candidate never receives a snapshot of its own term;
            // step down and bump the term to be safe.
            warn!(
                raft_id = %self.id,
                "attempted to restore snapshot as leader; should never happen"
            );
            self.become_follower(self.term + 1, NodeId::NONE);
            return false;
        }

        let cs = snapshot.metadata.conf_state.clone();
        let found = [&cs.voters, &cs.learners, &cs.voters_outgoing]
            .iter()
            .any(|set| set.contains(&self.id));
        if !found {
            warn!(
                raft_id = %self.id,
                conf_state = ?cs,
                "attempted to restore snapshot but it is not in the conf state; should never happen"
            );
            return false;
        }

        if self.raft_log.match_term(index, term) {
            info!(
                raft_id = %self.id,
                commit = self.raft_log.committed,
                last_index = self.raft_log.last_index(),
                last_term = self.raft_log.last_term(),
                index,
                term,
                "fast-forwarded commit to snapshot"
            );
            self.raft_log.commit_to(index);
            return false;
        }

        self.raft_log.restore(snapshot);

        self.tracker = ProgressTracker::new(
            self.tracker.max_inflight(),
            self.tracker.max_inflight_bytes(),
        );
        let (cfg, prs) = match confchange::restore(&self.tracker, self.raft_log.last_index(), &cs) {
            Ok(restored) => restored,
            Err(e) => panic!("unable to restore config {cs:?}: {e}"),
        };
        let restored = self.switch_to_config(cfg, prs);
        assert_equivalent(&cs, &restored);

        if let Some(pr) = self.tracker.get_mut(self.id) {
            let last = pr.next_idx - 1;
            pr.maybe_update(last);
        }

        info!(
            raft_id = %self.id,
            commit = self.raft_log.committed,
            last_index = self.raft_log.last_index(),
            last_term = self.raft_log.last_term(),
            index,
            term,
            "restored snapshot"
        );
        true
    }

    /// Loads a persisted hard state.
    ///
    /// # Panics
    /// Panics if its commit index is outside the log.
    pub(crate) fn load_state(&mut self, hs: &HardState) {
        assert!(
            hs.commit >= self.raft_log.committed && hs.commit <= self.raft_log.last_index(),
            "{} state.commit {} is out of range [{}, {}]",
            self.id,
            hs.commit,
            self.raft_log.committed,
            self.raft_log.last_index()
        );
        self.raft_log.committed = hs.commit;
        self.term = hs.term;
        self.vote = hs.vote;
    }

    /// Returns true once the randomized election timeout has elapsed.
    #[must_use]
    pub const fn past_election_timeout(&self) -> bool {
        self.election_elapsed >= self.randomized_election_timeout
    }

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout =
            self.election_timeout + self.rng.gen_range(0..self.election_timeout);
    }

    pub(crate) fn send_timeout_now(&mut self, to: NodeId) {
        self.send(Message::new(MessageType::TimeoutNow, NodeId::NONE, to));
    }

    pub(crate) fn abort_leader_transfer(&mut self) {
        self.lead_transferee = NodeId::NONE;
    }

    /// Returns true if the leader has committed an entry of its own term,
    /// which it must before serving reads.
    pub(crate) fn committed_entry_in_current_term(&self) -> bool {
        let term = self.raft_log.term(self.raft_log.committed);
        self.raft_log.zero_term_on_out_of_bounds(term) == self.term
    }

    /// Answers a read-index request at `read_index`. Local requests become a
    /// read state; remote ones get a `ReadIndexResp`.
    pub(crate) fn response_to_read_index_req(
        &mut self,
        req: Message,
        read_index: u64,
    ) -> Option<Message> {
        if req.from.is_none() || req.from == self.id {
            self.read_states
                .push(ReadState::new(read_index, request_ctx(&req)));
            return None;
        }
        let mut resp = Message::new(MessageType::ReadIndexResp, NodeId::NONE, req.from);
        resp.index = read_index;
        resp.entries = req.entries;
        Some(resp)
    }

    /// Accounts for new uncommitted entries. Returns false if they would
    /// exceed the budget.
    ///
    /// A single proposal is always admitted when nothing is uncommitted, so
    /// an oversized entry cannot stall the group forever. Empty entries
    /// (such as the one a new leader appends) are always admitted.
    pub(crate) fn increase_uncommitted_size(&mut self, entries: &[Entry]) -> bool {
        let size = payloads_size(entries);
        if self.uncommitted_size > 0
            && size > 0
            && self.uncommitted_size + size > self.max_uncommitted_size
        {
            return false;
        }
        self.uncommitted_size += size;
        true
    }

    /// Releases budget for entries that were committed and applied.
    pub(crate) fn reduce_uncommitted_size(&mut self, size: u64) {
        // The tail may have been reset by a term change in the meantime.
        self.uncommitted_size = self.uncommitted_size.saturating_sub(size);
    }
}

impl<S: Storage> fmt::Debug for Raft<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raft")
            .field("id", &self.id)
            .field("term", &self.term)
            .field("vote", &self.vote)
            .field("state", &self.state)
            .field("lead", &self.lead)
            .field("raft_log", &self.raft_log)
            .finish_non_exhaustive()
    }
}

fn assert_equivalent(expected: &ConfState, actual: &ConfState) {
    assert!(
        expected.equivalent(actual),
        "conf states not equivalent after restore:\n{actual:?}\n{expected:?}"
    );
}
