//! Message dispatch.
//!
//! [`Raft::step`] first reconciles the message's term with the local term,
//! handles the messages every role treats the same way, and then hands the
//! rest to the handler for the current role.

use bytes::Bytes;
use keel_core::NodeId;
use tracing::{debug, error, info, warn};

use crate::confchange::ConfChange;
use crate::error::{DropReason, RaftError, RaftResult};
use crate::message::{entries_size, payloads_size, Entry, Message, MessageType};
use crate::quorum::VoteResult;
use crate::read_only::{request_ctx, ReadOnlyOption, ReadState};
use crate::state::{CampaignType, Raft, StateRole, CAMPAIGN_TRANSFER};
use crate::storage::Storage;
use crate::tracker::ProgressState;

const fn dropped(reason: DropReason) -> RaftError {
    RaftError::ProposalDropped { reason }
}

impl<S: Storage> Raft<S> {
    /// Feeds a message into the state machine.
    ///
    /// # Errors
    /// Returns `ProposalDropped` when a proposal cannot be accepted, and
    /// `Malformed` when a proposed conf change cannot be decoded.
    pub fn step(&mut self, m: Message) -> RaftResult<()> {
        if m.term == 0 {
            // Local message.
        } else if m.term > self.term {
            if matches!(m.msg_type, MessageType::Vote | MessageType::PreVote) {
                let force = m.context.as_ref() == CAMPAIGN_TRANSFER;
                let in_lease = self.check_quorum
                    && !self.lead.is_none()
                    && self.election_elapsed < self.election_timeout();
                if !force && in_lease {
                    // Heard from a leader within the minimum election
                    // timeout: the candidate is disruptive, ignore it.
                    info!(
                        raft_id = %self.id,
                        log_term = self.raft_log.last_term(),
                        index = self.raft_log.last_index(),
                        vote = %self.vote,
                        msg_type = ?m.msg_type,
                        from = %m.from,
                        term = self.term,
                        remaining_ticks = self.election_timeout() - self.election_elapsed,
                        "ignored vote request: lease is not expired"
                    );
                    return Ok(());
                }
            }

            match m.msg_type {
                // A pre-vote never changes the term.
                MessageType::PreVote => {}
                // A granted pre-vote carries the future term; the real
                // election moves to it once the pre-vote is won.
                MessageType::PreVoteResp if !m.reject => {}
                _ => {
                    info!(
                        raft_id = %self.id,
                        term = self.term,
                        msg_type = ?m.msg_type,
                        from = %m.from,
                        msg_term = m.term,
                        "received a message with higher term"
                    );
                    if matches!(
                        m.msg_type,
                        MessageType::App | MessageType::Heartbeat | MessageType::Snap
                    ) {
                        self.become_follower(m.term, m.from);
                    } else {
                        self.become_follower(m.term, NodeId::NONE);
                    }
                }
            }
        } else if m.term < self.term {
            if (self.check_quorum || self.pre_vote)
                && matches!(m.msg_type, MessageType::Heartbeat | MessageType::App)
            {
                // A partitioned leader with a stale term keeps sending. The
                // response carries our term and makes it step down, which
                // lets a node isolated by a pre-vote or check-quorum rejoin.
                self.send(Message::new(MessageType::AppResp, NodeId::NONE, m.from));
            } else if m.msg_type == MessageType::PreVote {
                // Reject so the pre-candidate learns the term and does not
                // wait forever.
                info!(
                    raft_id = %self.id,
                    term = self.term,
                    from = %m.from,
                    msg_term = m.term,
                    "rejected pre-vote with lower term"
                );
                let mut resp = Message::new(MessageType::PreVoteResp, NodeId::NONE, m.from);
                resp.term = self.term;
                resp.reject = true;
                self.send(resp);
            } else if m.msg_type == MessageType::StorageAppendResp {
                // Entries written under an old term may have been replaced,
                // but a durable snapshot is still a durable snapshot.
                if m.index != 0 {
                    info!(
                        raft_id = %self.id,
                        term = self.term,
                        msg_term = m.term,
                        "ignored entry appends from a storage response with lower term"
                    );
                }
                if let Some(snapshot) = m.snapshot.as_ref().filter(|s| !s.is_empty()) {
                    self.applied_snap(snapshot);
                }
            } else {
                info!(
                    raft_id = %self.id,
                    term = self.term,
                    msg_type = ?m.msg_type,
                    from = %m.from,
                    msg_term = m.term,
                    "ignored a message with lower term"
                );
            }
            return Ok(());
        }

        match m.msg_type {
            MessageType::Hup => {
                if self.pre_vote {
                    self.hup(CampaignType::PreElection);
                } else {
                    self.hup(CampaignType::Election);
                }
                Ok(())
            }
            MessageType::StorageAppendResp => {
                if m.index != 0 {
                    self.raft_log.stable_to(m.index, m.log_term);
                }
                if let Some(snapshot) = m.snapshot.as_ref().filter(|s| !s.is_empty()) {
                    self.applied_snap(snapshot);
                }
                Ok(())
            }
            MessageType::StorageApplyResp => {
                if let Some(last) = m.entries.last() {
                    self.applied_to(last.index, entries_size(&m.entries));
                    self.reduce_uncommitted_size(payloads_size(&m.entries));
                }
                Ok(())
            }
            MessageType::Vote | MessageType::PreVote => {
                self.handle_vote_request(&m);
                Ok(())
            }
            _ => match self.state {
                StateRole::Leader => self.step_leader(m),
                StateRole::Candidate | StateRole::PreCandidate => self.step_candidate(m),
                StateRole::Follower => self.step_follower(m),
            },
        }
    }

    fn handle_vote_request(&mut self, m: &Message) {
        // A repeated vote for the same candidate is fine; otherwise vote only
        // when neither voted nor following anyone in this term. Pre-votes for
        // a future term are always considered.
        let can_vote = self.vote == m.from
            || (self.vote.is_none() && self.lead.is_none())
            || (m.msg_type == MessageType::PreVote && m.term > self.term);

        let mut resp = Message::new(m.msg_type.vote_response(), NodeId::NONE, m.from);
        if can_vote && self.raft_log.is_up_to_date(m.index, m.log_term) {
            info!(
                raft_id = %self.id,
                log_term = self.raft_log.last_term(),
                index = self.raft_log.last_index(),
                vote = %self.vote,
                msg_type = ?m.msg_type,
                from = %m.from,
                msg_log_term = m.log_term,
                msg_index = m.index,
                term = self.term,
                "cast vote"
            );
            // Grants carry the candidate's term so that a pre-candidate can
            // tell them apart from stale responses.
            resp.term = m.term;
            self.send(resp);
            if m.msg_type == MessageType::Vote {
                self.election_elapsed = 0;
                self.vote = m.from;
            }
        } else {
            info!(
                raft_id = %self.id,
                log_term = self.raft_log.last_term(),
                index = self.raft_log.last_index(),
                vote = %self.vote,
                msg_type = ?m.msg_type,
                from = %m.from,
                msg_log_term = m.log_term,
                msg_index = m.index,
                term = self.term,
                "rejected vote"
            );
            resp.term = self.term;
            resp.reject = true;
            self.send(resp);
        }
    }

    fn step_leader(&mut self, mut m: Message) -> RaftResult<()> {
        // These message types do not need a progress for m.from.
        match m.msg_type {
            MessageType::Beat => {
                self.bcast_heartbeat();
                return Ok(());
            }
            MessageType::CheckQuorum => {
                if !self.tracker.quorum_active() {
                    warn!(
                        raft_id = %self.id,
                        "stepped down to follower since quorum is not active"
                    );
                    self.become_follower(self.term, NodeId::NONE);
                }
                // Everyone but ourselves must prove itself active again
                // before the next check.
                let id = self.id;
                for (&peer, pr) in self.tracker.progress_mut().iter_mut() {
                    if peer != id {
                        pr.recent_active = false;
                    }
                }
                return Ok(());
            }
            MessageType::Prop => {
                assert!(!m.entries.is_empty(), "{} stepped empty Prop", self.id);
                if self.tracker.get(self.id).is_none() {
                    // Removed from the configuration while still leading.
                    return Err(dropped(DropReason::NotInConfiguration));
                }
                if !self.lead_transferee.is_none() {
                    debug!(
                        raft_id = %self.id,
                        term = self.term,
                        lead_transferee = %self.lead_transferee,
                        "transfer leadership is in progress; dropping proposal"
                    );
                    return Err(dropped(DropReason::LeadershipTransfer));
                }

                self.validate_conf_changes(&mut m.entries)?;

                if !self.append_entry(m.entries) {
                    return Err(dropped(DropReason::UncommittedSizeLimit));
                }
                self.bcast_append();
                return Ok(());
            }
            MessageType::ReadIndex => {
                // Only one voter: the leader can answer on its own.
                if self.tracker.is_singleton() {
                    let committed = self.raft_log.committed;
                    if let Some(resp) = self.response_to_read_index_req(m, committed) {
                        self.send(resp);
                    }
                    return Ok(());
                }
                // The commit index is only trustworthy once an entry of
                // this term has committed.
                if !self.committed_entry_in_current_term() {
                    self.pending_read_index_messages.push(m);
                    return Ok(());
                }
                self.send_read_index_response(m);
                return Ok(());
            }
            MessageType::ForgetLeader => return Ok(()),
            _ => {}
        }

        let from = m.from;
        if self.tracker.get(from).is_none() {
            debug!(raft_id = %self.id, from = %from, "no progress available");
            return Ok(());
        }

        match m.msg_type {
            MessageType::AppResp => self.handle_append_response(&m),
            MessageType::HeartbeatResp => self.handle_heartbeat_response(&m),
            MessageType::SnapStatus => {
                let Some(pr) = self.tracker.get_mut(from) else {
                    return Ok(());
                };
                if pr.state != ProgressState::Snapshot {
                    return Ok(());
                }
                if m.reject {
                    // Clear the pending snapshot first, or the probe would
                    // start from a snapshot index that was never applied.
                    pr.pending_snapshot = 0;
                    pr.become_probe();
                    debug!(
                        raft_id = %self.id,
                        to = %from,
                        progress = %pr,
                        "snapshot failed, resumed sending replication messages"
                    );
                } else {
                    pr.become_probe();
                    debug!(
                        raft_id = %self.id,
                        to = %from,
                        progress = %pr,
                        "snapshot succeeded, resumed sending replication messages"
                    );
                }
                // Wait for an AppResp (success) or the next heartbeat
                // (failure) before sending again.
                pr.msg_app_flow_paused = true;
            }
            MessageType::Unreachable => {
                let Some(pr) = self.tracker.get_mut(from) else {
                    return Ok(());
                };
                // An optimistic append was most likely lost.
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                debug!(
                    raft_id = %self.id,
                    to = %from,
                    progress = %pr,
                    "failed to send message because it is unreachable"
                );
            }
            MessageType::TransferLeader => self.handle_transfer_leader(from),
            _ => {}
        }
        Ok(())
    }

    /// Checks every proposed conf change against the current configuration.
    /// A change that may not be proposed now is replaced by an empty normal
    /// entry, unless validation is disabled.
    fn validate_conf_changes(&mut self, entries: &mut [Entry]) -> RaftResult<()> {
        let decoded = entries
            .iter()
            .map(|e| {
                e.is_conf_change()
                    .then(|| ConfChange::decode(e.entry_type, &e.data))
                    .transpose()
            })
            .collect::<RaftResult<Vec<_>>>()?;

        let last_index = self.raft_log.last_index();
        for (i, cc) in decoded.iter().enumerate() {
            let Some(cc) = cc else {
                continue;
            };
            let already_pending = self.pending_conf_index > self.raft_log.applied;
            let already_joint = self.tracker.config().voters.is_joint();
            let wants_leave_joint = cc.changes().is_empty();

            let failed_check = if already_pending {
                Some(format!(
                    "possible unapplied conf change at index {} (applied to {})",
                    self.pending_conf_index, self.raft_log.applied
                ))
            } else if already_joint && !wants_leave_joint {
                Some("must transition out of joint config first".to_owned())
            } else if !already_joint && wants_leave_joint {
                Some("not in joint state; refusing empty conf change".to_owned())
            } else {
                None
            };

            match failed_check {
                Some(reason) if !self.disable_conf_change_validation => {
                    info!(
                        raft_id = %self.id,
                        config = %self.tracker.config(),
                        reason = %reason,
                        "ignoring conf change"
                    );
                    entries[i] = Entry::default();
                }
                _ => self.pending_conf_index = last_index + i as u64 + 1,
            }
        }
        Ok(())
    }

    fn handle_append_response(&mut self, m: &Message) {
        let from = m.from;
        let first_index = self.raft_log.first_index();

        if m.reject {
            debug!(
                raft_id = %self.id,
                from = %from,
                index = m.index,
                reject_hint = m.reject_hint,
                log_term = m.log_term,
                "received rejected AppResp"
            );
            // The hint is the follower's suggested probe point and log_term
            // its term there. Every index of ours with a larger term must
            // also fail, so skip straight past them.
            let next_probe_idx = if m.log_term > 0 {
                self.raft_log
                    .find_conflict_by_term(m.reject_hint, m.log_term)
                    .0
            } else {
                m.reject_hint
            };
            let Some(pr) = self.tracker.get_mut(from) else {
                return;
            };
            pr.recent_active = true;
            if pr.maybe_decr_to(m.index, next_probe_idx) {
                debug!(raft_id = %self.id, to = %from, progress = %pr, "decreased progress");
                if pr.state == ProgressState::Replicate {
                    pr.become_probe();
                }
                self.send_append(from);
            }
            return;
        }

        let (updated, old_paused) = {
            let Some(pr) = self.tracker.get_mut(from) else {
                return;
            };
            pr.recent_active = true;
            let old_paused = pr.is_paused();
            // A response that matches what a probing peer already has still
            // moves it back to replicating.
            if pr.maybe_update(m.index)
                || (pr.matched == m.index && pr.state == ProgressState::Probe)
            {
                match pr.state {
                    ProgressState::Probe => pr.become_replicate(),
                    ProgressState::Snapshot if pr.matched + 1 >= first_index => {
                        // Caught up from the log, whatever snapshot was
                        // actually applied. Go through probe so the pending
                        // snapshot is accounted for.
                        debug!(
                            raft_id = %self.id,
                            to = %from,
                            progress = %pr,
                            "recovered from needing snapshot, resumed sending replication messages"
                        );
                        pr.become_probe();
                        pr.become_replicate();
                    }
                    ProgressState::Replicate => pr.inflights.free_le(m.index),
                    ProgressState::Snapshot => {}
                }
                (true, old_paused)
            } else {
                (false, old_paused)
            }
        };
        if !updated {
            return;
        }

        if self.maybe_commit() {
            // Committed in the current term: reads can be served now.
            self.release_pending_read_index_messages();
            self.bcast_append();
        } else if old_paused {
            // The peer may have missed the latest commit index.
            self.send_append(from);
        }
        // Flow control may now allow several messages at once.
        if from != self.id {
            while self.maybe_send_append(from, false) {}
        }

        let matched = self.tracker.get(from).map_or(0, |pr| pr.matched);
        if from == self.lead_transferee && matched == self.raft_log.last_index() {
            info!(raft_id = %self.id, to = %from, "sent TimeoutNow after received AppResp");
            self.send_timeout_now(from);
        }
    }

    fn handle_heartbeat_response(&mut self, m: &Message) {
        let from = m.from;
        let last_index = self.raft_log.last_index();
        let needs_append = {
            let Some(pr) = self.tracker.get_mut(from) else {
                return;
            };
            pr.recent_active = true;
            pr.msg_app_flow_paused = false;
            // Also unblocks a peer whose inflight window filled up with
            // appends that were all dropped.
            pr.matched < last_index || pr.state == ProgressState::Probe
        };
        if needs_append {
            self.send_append(from);
        }

        if self.read_only.option() != ReadOnlyOption::Safe || m.context.is_empty() {
            return;
        }

        let won = match self.read_only.recv_ack(from, &m.context) {
            Some(acks) => {
                self.tracker
                    .config()
                    .voters
                    .vote_result(|id| acks.contains(&id).then_some(true))
                    == VoteResult::Won
            }
            None => false,
        };
        if !won {
            return;
        }

        for rs in self.read_only.advance(m) {
            if let Some(resp) = self.response_to_read_index_req(rs.req, rs.index) {
                self.send(resp);
            }
        }
    }

    fn handle_transfer_leader(&mut self, transferee: NodeId) {
        let Some(pr) = self.tracker.get(transferee) else {
            return;
        };
        if pr.is_learner {
            debug!(raft_id = %self.id, "is learner. Ignored transferring leadership");
            return;
        }
        let up_to_date = pr.matched == self.raft_log.last_index();

        let last = self.lead_transferee;
        if !last.is_none() {
            if last == transferee {
                info!(
                    raft_id = %self.id,
                    term = self.term,
                    transferee = %transferee,
                    "transfer leadership is in progress, ignores request to same node"
                );
                return;
            }
            self.abort_leader_transfer();
            info!(
                raft_id = %self.id,
                term = self.term,
                last_transferee = %last,
                "abort previous transferring leadership"
            );
        }
        if transferee == self.id {
            debug!(
                raft_id = %self.id,
                "is already leader. Ignored transferring leadership to self"
            );
            return;
        }

        info!(
            raft_id = %self.id,
            term = self.term,
            transferee = %transferee,
            "starts to transfer leadership"
        );
        // The transfer must complete within one election timeout.
        self.election_elapsed = 0;
        self.lead_transferee = transferee;
        if up_to_date {
            self.send_timeout_now(transferee);
            info!(
                raft_id = %self.id,
                transferee = %transferee,
                "sends TimeoutNow immediately as transferee already has up-to-date log"
            );
        } else {
            self.send_append(transferee);
        }
    }

    fn send_read_index_response(&mut self, m: Message) {
        match self.read_only.option() {
            ReadOnlyOption::Safe => {
                // Confirm leadership with a heartbeat round tagged with the
                // request context. The leader acknowledges itself.
                let ctx = request_ctx(&m);
                self.read_only.add_request(self.raft_log.committed, m);
                self.read_only.recv_ack(self.id, &ctx);
                self.bcast_heartbeat_with_ctx(&ctx);
            }
            ReadOnlyOption::LeaseBased => {
                let committed = self.raft_log.committed;
                if let Some(resp) = self.response_to_read_index_req(m, committed) {
                    self.send(resp);
                }
            }
        }
    }

    fn release_pending_read_index_messages(&mut self) {
        if self.pending_read_index_messages.is_empty() {
            return;
        }
        if !self.committed_entry_in_current_term() {
            error!(
                raft_id = %self.id,
                "pending ReadIndex should be released only after first commit in current term"
            );
            return;
        }
        for m in std::mem::take(&mut self.pending_read_index_messages) {
            self.send_read_index_response(m);
        }
    }

    fn step_candidate(&mut self, m: Message) -> RaftResult<()> {
        match m.msg_type {
            MessageType::Prop => {
                info!(raft_id = %self.id, term = self.term, "no leader; dropping proposal");
                return Err(dropped(DropReason::NoLeader));
            }
            // A leader of our own term exists.
            MessageType::App => {
                self.become_follower(m.term, m.from);
                self.handle_append_entries(m);
            }
            MessageType::Heartbeat => {
                self.become_follower(m.term, m.from);
                self.handle_heartbeat(m);
            }
            MessageType::Snap => {
                self.become_follower(m.term, m.from);
                self.handle_snapshot(m);
            }
            MessageType::PreVoteResp | MessageType::VoteResp => {
                let expected = if self.state == StateRole::PreCandidate {
                    MessageType::PreVoteResp
                } else {
                    MessageType::VoteResp
                };
                if m.msg_type != expected {
                    return Ok(());
                }
                let (granted, rejected, result) = self.poll(m.from, m.msg_type, !m.reject);
                info!(
                    raft_id = %self.id,
                    granted,
                    rejected,
                    msg_type = ?m.msg_type,
                    "received votes and vote rejections"
                );
                match result {
                    VoteResult::Won => {
                        if self.state == StateRole::PreCandidate {
                            self.campaign(CampaignType::Election);
                        } else {
                            self.become_leader();
                            self.bcast_append();
                        }
                    }
                    VoteResult::Lost => {
                        // Step down with the term unchanged; a higher term,
                        // if any, was already handled in step.
                        self.become_follower(self.term, NodeId::NONE);
                    }
                    VoteResult::Pending => {}
                }
            }
            MessageType::TimeoutNow => {
                debug!(
                    raft_id = %self.id,
                    term = self.term,
                    state = %self.state,
                    from = %m.from,
                    "ignored TimeoutNow"
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn step_follower(&mut self, mut m: Message) -> RaftResult<()> {
        match m.msg_type {
            MessageType::Prop => {
                if self.lead.is_none() {
                    info!(raft_id = %self.id, term = self.term, "no leader; dropping proposal");
                    return Err(dropped(DropReason::NoLeader));
                }
                if self.disable_proposal_forwarding {
                    info!(
                        raft_id = %self.id,
                        lead = %self.lead,
                        term = self.term,
                        "not forwarding to leader; dropping proposal"
                    );
                    return Err(dropped(DropReason::ForwardingDisabled));
                }
                m.to = self.lead;
                self.send(m);
            }
            MessageType::App => {
                self.election_elapsed = 0;
                self.lead = m.from;
                self.handle_append_entries(m);
            }
            MessageType::Heartbeat => {
                self.election_elapsed = 0;
                self.lead = m.from;
                self.handle_heartbeat(m);
            }
            MessageType::Snap => {
                self.election_elapsed = 0;
                self.lead = m.from;
                self.handle_snapshot(m);
            }
            MessageType::TransferLeader => {
                if self.lead.is_none() {
                    info!(
                        raft_id = %self.id,
                        term = self.term,
                        "no leader; dropping leader transfer msg"
                    );
                    return Ok(());
                }
                m.to = self.lead;
                self.send(m);
            }
            MessageType::ForgetLeader => {
                if self.read_only.option() == ReadOnlyOption::LeaseBased {
                    // Forgetting the leader would break its lease.
                    error!(raft_id = %self.id, "ignoring ForgetLeader due to lease based reads");
                    return Ok(());
                }
                if !self.lead.is_none() {
                    info!(
                        raft_id = %self.id,
                        lead = %self.lead,
                        term = self.term,
                        "forgetting leader"
                    );
                    self.lead = NodeId::NONE;
                }
            }
            MessageType::TimeoutNow => {
                info!(
                    raft_id = %self.id,
                    term = self.term,
                    from = %m.from,
                    "received TimeoutNow and starts an election to get leadership"
                );
                // Leadership transfers never use pre-vote: the leader asked
                // for this election.
                self.hup(CampaignType::Transfer);
            }
            MessageType::ReadIndex => {
                if self.lead.is_none() {
                    info!(
                        raft_id = %self.id,
                        term = self.term,
                        "no leader; dropping index reading msg"
                    );
                    return Ok(());
                }
                m.to = self.lead;
                self.send(m);
            }
            MessageType::ReadIndexResp => {
                let [entry] = m.entries.as_slice() else {
                    error!(
                        raft_id = %self.id,
                        from = %m.from,
                        entries = m.entries.len(),
                        "invalid format of ReadIndexResp"
                    );
                    return Ok(());
                };
                self.read_states
                    .push(ReadState::new(m.index, entry.data.clone()));
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn handle_append_entries(&mut self, m: Message) {
        if m.index < self.raft_log.committed {
            let mut resp = Message::new(MessageType::AppResp, NodeId::NONE, m.from);
            resp.index = self.raft_log.committed;
            self.send(resp);
            return;
        }

        if let Some(last_index) =
            self.raft_log
                .maybe_append(m.index, m.log_term, m.commit, &m.entries)
        {
            let mut resp = Message::new(MessageType::AppResp, NodeId::NONE, m.from);
            resp.index = last_index;
            self.send(resp);
            return;
        }

        let our_term = self.raft_log.term(m.index);
        debug!(
            raft_id = %self.id,
            log_term = self.raft_log.zero_term_on_out_of_bounds(our_term),
            index = m.index,
            msg_log_term = m.log_term,
            from = %m.from,
            "rejected App"
        );

        // Point the leader at the largest index whose term is at most the
        // term it probed with; everything after that must conflict.
        let hint_index = m.index.min(self.raft_log.last_index());
        let (hint_index, hint_term) = self.raft_log.find_conflict_by_term(hint_index, m.log_term);
        let mut resp = Message::new(MessageType::AppResp, NodeId::NONE, m.from);
        resp.index = m.index;
        resp.reject = true;
        resp.reject_hint = hint_index;
        resp.log_term = hint_term;
        self.send(resp);
    }

    pub(crate) fn handle_heartbeat(&mut self, m: Message) {
        self.raft_log.commit_to(m.commit);
        let mut resp = Message::new(MessageType::HeartbeatResp, NodeId::NONE, m.from);
        resp.context = m.context;
        self.send(resp);
    }

    pub(crate) fn handle_snapshot(&mut self, m: Message) {
        let snapshot = m.snapshot.unwrap_or_default();
        let (index, term) = (snapshot.metadata.index, snapshot.metadata.term);

        let mut resp = Message::new(MessageType::AppResp, NodeId::NONE, m.from);
        if self.restore(snapshot) {
            info!(
                raft_id = %self.id,
                commit = self.raft_log.committed,
                index,
                term,
                "restored snapshot"
            );
            resp.index = self.raft_log.last_index();
        } else {
            info!(
                raft_id = %self.id,
                commit = self.raft_log.committed,
                index,
                term,
                "ignored snapshot"
            );
            resp.index = self.raft_log.committed;
        }
        self.send(resp);
    }

    /// Context of the newest outstanding read request, if any.
    #[must_use]
    pub fn last_pending_read_ctx(&self) -> Bytes {
        self.read_only.last_pending_request_ctx()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confchange::ConfChangeType;
    use crate::message::{ConfState, EntryType, Snapshot, SnapshotMetadata};
    use crate::storage::MemoryStorage;
    use crate::test_util::{
        msg, new_config, new_storage, new_test_raft, new_test_raft_with_config, nid, persist,
        read_messages,
    };

    fn prop(data: &'static [u8]) -> Message {
        let mut m = Message::new(MessageType::Prop, NodeId::NONE, NodeId::NONE);
        m.entries = vec![Entry::new(0, 0, Bytes::from_static(data))];
        m
    }

    fn elect(r: &mut Raft<MemoryStorage>) {
        r.become_candidate();
        r.become_leader();
        // Commit the empty entry of the new term by hand.
        persist(r);
        r.msgs.clear();
    }

    fn ack_all(r: &mut Raft<MemoryStorage>, peers: &[u64]) {
        let last = r.raft_log.last_index();
        for &p in peers {
            let mut resp = msg(MessageType::AppResp, p, 1, r.term);
            resp.index = last;
            r.step(resp).unwrap();
        }
    }

    #[test]
    fn test_hup_starts_election() {
        let mut r = new_test_raft(1, &[1, 2, 3], 10, 1);
        assert_eq!(r.term, 0);

        r.step(Message::new(MessageType::Hup, nid(1), NodeId::NONE))
            .unwrap();
        assert_eq!(r.state, StateRole::Candidate);
        assert_eq!(r.term, 1);
        assert_eq!(r.vote, nid(1));

        let msgs = read_messages(&mut r);
        let mut votes: Vec<_> = msgs
            .iter()
            .filter(|m| m.msg_type == MessageType::Vote)
            .map(|m| (m.to, m.term))
            .collect();
        votes.sort();
        assert_eq!(votes, vec![(nid(2), 1), (nid(3), 1)]);
        assert_eq!(r.tracker().vote(nid(1)), Some(true));
    }

    #[test]
    fn test_leader_elected_on_quorum() {
        let mut r = new_test_raft(1, &[1, 2, 3], 10, 1);
        r.step(Message::new(MessageType::Hup, nid(1), NodeId::NONE))
            .unwrap();
        persist(&mut r);

        r.step(msg(MessageType::VoteResp, 2, 1, 1)).unwrap();
        assert_eq!(r.state, StateRole::Leader);
        assert_eq!(r.lead, nid(1));
        // The empty entry of the new term.
        assert_eq!(r.raft_log.last_index(), 1);
    }

    #[test]
    fn test_vote_lost_steps_down() {
        let mut r = new_test_raft(1, &[1, 2, 3], 10, 1);
        r.step(Message::new(MessageType::Hup, nid(1), NodeId::NONE))
            .unwrap();
        persist(&mut r);

        let mut rej = msg(MessageType::VoteResp, 2, 1, 1);
        rej.reject = true;
        r.step(rej.clone()).unwrap();
        assert_eq!(r.state, StateRole::Candidate);
        rej.from = nid(3);
        r.step(rej).unwrap();
        assert_eq!(r.state, StateRole::Follower);
        assert_eq!(r.term, 1);
    }

    #[test]
    fn test_inflight_window_blocks_fourth_proposal() {
        let config = new_config(1, 10, 1).with_max_inflight(3, 0);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2]));
        elect(&mut r);
        // Move peer 2 into replicate so proposals are pipelined.
        ack_all(&mut r, &[2]);
        r.msgs.clear();

        for data in [b"a" as &[u8], b"b", b"c"] {
            r.step(prop(data)).unwrap();
            let msgs = read_messages(&mut r);
            assert_eq!(msgs.len(), 1, "one append per proposal");
        }
        assert!(r.tracker().get(nid(2)).unwrap().is_paused());

        r.step(prop(b"d")).unwrap();
        assert!(read_messages(&mut r).is_empty());
    }

    #[test]
    fn test_reject_hint_for_missing_index() {
        let storage = new_storage(&[1, 2]);
        storage.wl().append(&[Entry::new(1, 1, Bytes::new())]);
        let mut r = new_test_raft_with_config(&new_config(2, 10, 1), storage);

        let mut app = msg(MessageType::App, 1, 2, 2);
        app.index = 2;
        app.log_term = 2;
        r.step(app).unwrap();

        let msgs = read_messages(&mut r);
        assert_eq!(msgs.len(), 1);
        let resp = &msgs[0];
        assert_eq!(resp.msg_type, MessageType::AppResp);
        assert!(resp.reject);
        assert_eq!(resp.index, 2);
        assert_eq!(resp.reject_hint, 1);
        assert_eq!(resp.log_term, 1);
    }

    #[test]
    fn test_append_below_commit_acks_commit() {
        let storage = new_storage(&[1, 2]);
        storage.wl().append(&[
            Entry::new(1, 1, Bytes::new()),
            Entry::new(1, 2, Bytes::new()),
        ]);
        let mut r = new_test_raft_with_config(&new_config(2, 10, 1), storage);
        r.raft_log.commit_to(2);

        let mut app = msg(MessageType::App, 1, 2, 1);
        app.index = 1;
        app.log_term = 1;
        r.step(app).unwrap();

        let msgs = read_messages(&mut r);
        assert_eq!(msgs[0].index, 2);
        assert!(!msgs[0].reject);
    }

    #[test]
    fn test_leader_probes_after_rejection() {
        let mut r = new_test_raft(1, &[1, 2], 10, 1);
        elect(&mut r);
        for data in [b"a" as &[u8], b"b"] {
            r.step(prop(data)).unwrap();
        }
        read_messages(&mut r);

        let mut rej = msg(MessageType::AppResp, 2, 1, r.term);
        rej.index = 0;
        rej.reject = true;
        rej.reject_hint = 0;
        r.step(rej).unwrap();

        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.next_idx, 1);
        let msgs = read_messages(&mut r);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].index, 0);
        assert_eq!(msgs[0].entries.len(), 3);
    }

    #[test]
    fn test_commit_only_current_term() {
        // Entries of term 1 are on a quorum but must not commit until an
        // entry of the leader's own term does.
        let storage = new_storage(&[1, 2, 3]);
        storage.wl().append(&[
            Entry::new(1, 1, Bytes::new()),
            Entry::new(1, 2, Bytes::new()),
        ]);
        let mut r = new_test_raft_with_config(&new_config(1, 10, 1), storage);
        r.term = 1;
        r.become_candidate();
        r.become_leader();
        persist(&mut r);
        assert_eq!(r.term, 2);

        let mut resp = msg(MessageType::AppResp, 2, 1, 2);
        resp.index = 2;
        r.step(resp).unwrap();
        assert_eq!(r.raft_log.committed, 0);

        let mut resp = msg(MessageType::AppResp, 2, 1, 2);
        resp.index = 3;
        r.step(resp).unwrap();
        assert_eq!(r.raft_log.committed, 3);
    }

    #[test]
    fn test_follower_forwards_proposal() {
        let mut r = new_test_raft(2, &[1, 2], 10, 1);
        r.become_follower(1, nid(1));
        r.step(prop(b"x")).unwrap();
        let msgs = read_messages(&mut r);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].to, nid(1));
        assert_eq!(msgs[0].msg_type, MessageType::Prop);
        assert_eq!(msgs[0].term, 0);
    }

    #[test]
    fn test_proposal_dropped_reasons() {
        let mut r = new_test_raft(2, &[1, 2], 10, 1);
        let err = r.step(prop(b"x")).unwrap_err();
        assert_eq!(err, dropped(DropReason::NoLeader));

        let config = new_config(2, 10, 1).with_disable_proposal_forwarding(true);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2]));
        r.become_follower(1, nid(1));
        let err = r.step(prop(b"x")).unwrap_err();
        assert_eq!(err, dropped(DropReason::ForwardingDisabled));

        let mut r = new_test_raft(1, &[1, 2, 3], 10, 1);
        r.become_candidate();
        let err = r.step(prop(b"x")).unwrap_err();
        assert!(err.is_proposal_dropped());
    }

    #[test]
    fn test_uncommitted_size_limit() {
        let config = new_config(1, 10, 1).with_max_uncommitted_entries_size(4);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2]));
        elect(&mut r);

        // The first oversized proposal is admitted while nothing is pending.
        r.step(prop(b"hello")).unwrap();
        let err = r.step(prop(b"x")).unwrap_err();
        assert_eq!(err, dropped(DropReason::UncommittedSizeLimit));
        assert_eq!(r.uncommitted_size(), 5);

        r.reduce_uncommitted_size(5);
        assert_eq!(r.uncommitted_size(), 0);
        r.step(prop(b"x")).unwrap();
    }

    #[test]
    fn test_check_quorum_steps_down() {
        let config = new_config(1, 10, 1).with_check_quorum(true);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2, 3]));
        elect(&mut r);

        for _ in 0..r.election_timeout() {
            r.tick();
        }
        assert_eq!(r.state, StateRole::Follower);
        assert_eq!(r.term, 1);
    }

    #[test]
    fn test_check_quorum_keeps_active_leader() {
        let config = new_config(1, 10, 1).with_check_quorum(true);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2, 3]));
        elect(&mut r);

        for _ in 0..3 {
            r.step(msg(MessageType::HeartbeatResp, 2, 1, r.term))
                .unwrap();
            for _ in 0..r.election_timeout() {
                r.tick();
            }
            assert_eq!(r.state, StateRole::Leader);
        }
    }

    #[test]
    fn test_vote_ignored_inside_lease() {
        let config = new_config(1, 10, 1).with_check_quorum(true);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2, 3]));
        r.become_follower(1, nid(2));

        let mut vote = msg(MessageType::Vote, 3, 1, 2);
        vote.index = 10;
        vote.log_term = 2;
        r.step(vote.clone()).unwrap();
        assert_eq!(r.term, 1);
        assert!(read_messages(&mut r).is_empty());

        // A forced campaign bypasses the lease.
        vote.context = Bytes::from_static(CAMPAIGN_TRANSFER);
        r.step(vote).unwrap();
        assert_eq!(r.term, 2);
        assert_eq!(r.vote, nid(3));
    }

    #[test]
    fn test_pre_vote_keeps_term() {
        let config = new_config(1, 10, 1).with_pre_vote(true);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2, 3]));
        r.step(Message::new(MessageType::Hup, nid(1), NodeId::NONE))
            .unwrap();
        assert_eq!(r.state, StateRole::PreCandidate);
        assert_eq!(r.term, 0);

        let msgs = read_messages(&mut r);
        assert!(msgs
            .iter()
            .all(|m| m.msg_type == MessageType::PreVote && m.term == 1));

        r.step(msg(MessageType::PreVoteResp, 2, 1, 1)).unwrap();
        assert_eq!(r.state, StateRole::Candidate);
        assert_eq!(r.term, 1);
    }

    #[test]
    fn test_pre_vote_granted_without_vote() {
        let mut r = new_test_raft(2, &[1, 2, 3], 10, 1);
        let mut pv = msg(MessageType::PreVote, 1, 2, 1);
        pv.index = 0;
        r.step(pv).unwrap();
        assert_eq!(r.term, 0);
        assert!(r.vote.is_none());
        let msgs = read_messages(&mut r);
        assert_eq!(msgs[0].msg_type, MessageType::PreVoteResp);
        assert!(!msgs[0].reject);
        assert_eq!(msgs[0].term, 1);
    }

    #[test]
    fn test_stale_pre_vote_rejected() {
        let mut r = new_test_raft(2, &[1, 2, 3], 10, 1);
        r.become_follower(5, NodeId::NONE);
        r.step(msg(MessageType::PreVote, 1, 2, 3)).unwrap();
        let msgs = read_messages(&mut r);
        assert_eq!(msgs[0].msg_type, MessageType::PreVoteResp);
        assert!(msgs[0].reject);
        assert_eq!(msgs[0].term, 5);
    }

    #[test]
    fn test_vote_rejected_for_stale_log() {
        let storage = new_storage(&[1, 2, 3]);
        storage.wl().append(&[Entry::new(2, 1, Bytes::new())]);
        let mut r = new_test_raft_with_config(&new_config(2, 10, 1), storage);

        let mut vote = msg(MessageType::Vote, 1, 2, 3);
        vote.index = 5;
        vote.log_term = 1;
        r.step(vote).unwrap();
        let msgs = read_messages(&mut r);
        assert!(msgs[0].reject);
        assert!(r.vote.is_none());
        assert_eq!(r.term, 3);
    }

    #[test]
    fn test_transfer_leader_sends_timeout_now() {
        let mut r = new_test_raft(1, &[1, 2], 10, 1);
        elect(&mut r);
        ack_all(&mut r, &[2]);
        read_messages(&mut r);

        r.step(Message::new(MessageType::TransferLeader, nid(2), nid(1)))
            .unwrap();
        assert_eq!(r.lead_transferee, nid(2));
        let msgs = read_messages(&mut r);
        assert!(msgs.iter().any(|m| m.msg_type == MessageType::TimeoutNow));
        assert_eq!(
            r.step(prop(b"x")).unwrap_err(),
            dropped(DropReason::LeadershipTransfer)
        );
    }

    #[test]
    fn test_timeout_now_forces_campaign() {
        let config = new_config(2, 10, 1)
            .with_check_quorum(true)
            .with_pre_vote(true);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2]));
        r.become_follower(1, nid(1));
        r.step(msg(MessageType::TimeoutNow, 1, 2, 1)).unwrap();
        assert_eq!(r.state, StateRole::Candidate);
        assert_eq!(r.term, 2);
        let msgs = read_messages(&mut r);
        let vote = msgs
            .iter()
            .find(|m| m.msg_type == MessageType::Vote)
            .unwrap();
        assert_eq!(vote.context.as_ref(), CAMPAIGN_TRANSFER);
    }

    #[test]
    fn test_read_index_safe() {
        let mut r = new_test_raft(1, &[1, 2, 3], 10, 1);
        elect(&mut r);
        ack_all(&mut r, &[2, 3]);
        read_messages(&mut r);
        let committed = r.raft_log.committed;
        assert_eq!(committed, 1);

        let mut req = Message::new(MessageType::ReadIndex, nid(1), NodeId::NONE);
        req.entries = vec![Entry::new(0, 0, Bytes::from_static(b"ctx"))];
        r.step(req).unwrap();
        let beats = read_messages(&mut r);
        assert!(!beats.is_empty());
        for m in &beats {
            assert_eq!(m.msg_type, MessageType::Heartbeat);
            assert_eq!(m.context.as_ref(), b"ctx");
        }
        assert!(r.read_states.is_empty());

        let mut ack = msg(MessageType::HeartbeatResp, 2, 1, r.term);
        ack.context = Bytes::from_static(b"ctx");
        r.step(ack).unwrap();
        assert_eq!(
            r.read_states,
            vec![ReadState::new(committed, Bytes::from_static(b"ctx"))]
        );
    }

    #[test]
    fn test_read_index_postponed_until_commit() {
        let mut r = new_test_raft(1, &[1, 2, 3], 10, 1);
        elect(&mut r);

        let mut req = Message::new(MessageType::ReadIndex, nid(1), NodeId::NONE);
        req.entries = vec![Entry::new(0, 0, Bytes::from_static(b"early"))];
        r.step(req).unwrap();
        assert_eq!(r.pending_read_index_messages.len(), 1);

        ack_all(&mut r, &[2]);
        assert!(r.pending_read_index_messages.is_empty());
        assert_eq!(r.read_only().pending_read_count(), 1);
    }

    #[test]
    fn test_read_index_forwarded_response() {
        let mut r = new_test_raft(2, &[1, 2], 10, 1);
        r.become_follower(1, nid(1));
        let mut resp = msg(MessageType::ReadIndexResp, 1, 2, 1);
        resp.index = 7;
        resp.entries = vec![Entry::new(0, 0, Bytes::from_static(b"r"))];
        r.step(resp).unwrap();
        let expected = ReadState::new(7, Bytes::from_static(b"r"));
        assert_eq!(r.read_states, vec![expected]);
    }

    #[test]
    fn test_conf_change_refused_while_pending() {
        let mut r = new_test_raft(1, &[1, 2], 10, 1);
        elect(&mut r);
        ack_all(&mut r, &[2]);

        let cc = ConfChange::single(ConfChangeType::AddNode, 3);
        let mut m = Message::new(MessageType::Prop, nid(1), NodeId::NONE);
        m.entries = vec![cc.to_entry(), cc.to_entry()];
        r.step(m).unwrap();

        let entries = r.raft_log.next_unstable_ents().to_vec();
        assert_eq!(entries[0].entry_type, EntryType::ConfChange);
        // The second change is refused while the first is pending.
        assert_eq!(entries[1].entry_type, EntryType::Normal);
        assert!(entries[1].data.is_empty());
        assert_eq!(r.pending_conf_index, entries[0].index);
    }

    #[test]
    fn test_leave_joint_refused_when_not_joint() {
        let mut r = new_test_raft(1, &[1, 2], 10, 1);
        elect(&mut r);
        ack_all(&mut r, &[2]);
        r.raft_log.applied_to(r.raft_log.committed, 0);

        let mut m = Message::new(MessageType::Prop, nid(1), NodeId::NONE);
        m.entries = vec![ConfChange::leave().to_entry()];
        r.step(m).unwrap();
        let last = r.raft_log.next_unstable_ents().last().cloned().unwrap();
        assert_eq!(last.entry_type, EntryType::Normal);
    }

    #[test]
    fn test_malformed_conf_change_rejected() {
        let mut r = new_test_raft(1, &[1, 2], 10, 1);
        elect(&mut r);
        let mut m = Message::new(MessageType::Prop, nid(1), NodeId::NONE);
        let mut e = Entry::new(0, 0, Bytes::from_static(b"\xff"));
        e.entry_type = EntryType::ConfChangeV2;
        m.entries = vec![e];
        let last = r.raft_log.last_index();
        assert!(matches!(r.step(m), Err(RaftError::Malformed { .. })));
        assert_eq!(r.raft_log.last_index(), last);
    }

    #[test]
    fn test_snapshot_install() {
        let mut r = new_test_raft(2, &[1, 2], 10, 1);
        let snap = Snapshot {
            data: Bytes::new(),
            metadata: SnapshotMetadata {
                conf_state: ConfState::with_voters([1, 2, 3]),
                index: 11,
                term: 11,
            },
        };
        let mut m = msg(MessageType::Snap, 1, 2, 11);
        m.snapshot = Some(snap);
        r.step(m).unwrap();

        assert_eq!(r.raft_log.committed, 11);
        assert_eq!(r.raft_log.last_index(), 11);
        assert_eq!(r.tracker().voter_nodes(), vec![nid(1), nid(2), nid(3)]);
        let msgs = read_messages(&mut r);
        assert_eq!(msgs[0].msg_type, MessageType::AppResp);
        assert_eq!(msgs[0].index, 11);
    }

    #[test]
    fn test_stale_heartbeat_gets_response_under_check_quorum() {
        let config = new_config(2, 10, 1).with_check_quorum(true);
        let mut r = new_test_raft_with_config(&config, new_storage(&[1, 2]));
        r.become_follower(5, NodeId::NONE);
        r.step(msg(MessageType::Heartbeat, 1, 2, 3)).unwrap();
        let msgs = read_messages(&mut r);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, MessageType::AppResp);
        assert_eq!(msgs[0].term, 5);
    }

    #[test]
    fn test_unreachable_and_snap_status() {
        let mut r = new_test_raft(1, &[1, 2], 10, 1);
        elect(&mut r);
        ack_all(&mut r, &[2]);
        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Replicate);

        r.step(Message::new(MessageType::Unreachable, nid(2), nid(1)))
            .unwrap();
        assert_eq!(r.tracker().get(nid(2)).unwrap().state, ProgressState::Probe);

        r.tracker.get_mut(nid(2)).unwrap().become_snapshot(10);
        let mut status = Message::new(MessageType::SnapStatus, nid(2), nid(1));
        status.reject = true;
        r.step(status).unwrap();
        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.pending_snapshot, 0);
        assert!(pr.msg_app_flow_paused);
    }

    /// A leader of `[1, 2]` whose log was compacted through index 3, with
    /// peer 2 probing at 4.
    fn compacted_leader() -> Raft<MemoryStorage> {
        let storage = new_storage(&[1, 2]);
        storage
            .wl()
            .apply_snapshot(Snapshot {
                data: Bytes::new(),
                metadata: SnapshotMetadata {
                    conf_state: ConfState::with_voters([1, 2]),
                    index: 3,
                    term: 1,
                },
            })
            .unwrap();
        let mut r = new_test_raft_with_config(&new_config(1, 10, 1), storage);
        elect(&mut r);
        assert_eq!(r.raft_log.first_index(), 4);
        r
    }

    fn snapshots_to(msgs: &[Message], to: u64) -> Vec<&Message> {
        msgs.iter()
            .filter(|m| m.msg_type == MessageType::Snap && m.to == nid(to))
            .collect()
    }

    #[test]
    fn test_leader_sends_snapshot_when_log_compacted() {
        let mut r = compacted_leader();

        // Peer 2 has nothing, so probing falls back to index 1, which is
        // gone.
        let mut reject = msg(MessageType::AppResp, 2, 1, r.term);
        reject.reject = true;
        reject.index = 3;
        reject.reject_hint = 0;
        r.step(reject).unwrap();

        let msgs = read_messages(&mut r);
        let snaps = snapshots_to(&msgs, 2);
        assert_eq!(snaps.len(), 1);
        let snapshot = snaps[0].snapshot.as_ref().unwrap();
        assert_eq!((snapshot.metadata.index, snapshot.metadata.term), (3, 1));
        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Snapshot);
        assert_eq!(pr.pending_snapshot, 3);
        assert!(pr.is_paused());

        // Installing it acks the snapshot index; replication resumes from
        // there.
        let mut ack = msg(MessageType::AppResp, 2, 1, r.term);
        ack.index = 3;
        r.step(ack).unwrap();
        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Replicate);
        assert_eq!(pr.matched, 3);
        assert_eq!(pr.pending_snapshot, 0);

        let msgs = read_messages(&mut r);
        let app = msgs
            .iter()
            .find(|m| m.msg_type == MessageType::App && m.to == nid(2))
            .unwrap();
        assert_eq!((app.index, app.log_term), (3, 1));
        assert_eq!(app.entries[0].index, 4);
        assert!(snapshots_to(&msgs, 2).is_empty());
    }

    #[test]
    fn test_snapshot_waits_for_recently_active_peer() {
        let mut r = compacted_leader();
        {
            let pr = r.tracker.get_mut(nid(2)).unwrap();
            pr.recent_active = false;
            pr.next_idx = 1;
        }

        r.step(prop(b"x")).unwrap();
        let msgs = read_messages(&mut r);
        assert!(snapshots_to(&msgs, 2).is_empty());
        assert_eq!(r.tracker().get(nid(2)).unwrap().state, ProgressState::Probe);

        // Hearing from the peer makes it worth the transfer.
        r.step(msg(MessageType::HeartbeatResp, 2, 1, r.term))
            .unwrap();
        let msgs = read_messages(&mut r);
        assert_eq!(snapshots_to(&msgs, 2).len(), 1);
        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Snapshot);
    }

    #[test]
    fn test_snapshot_temporarily_unavailable_is_retried() {
        let mut r = compacted_leader();
        r.tracker.get_mut(nid(2)).unwrap().next_idx = 1;
        r.raft_log.store.wl().set_snapshot_unavailable(true);

        r.step(msg(MessageType::HeartbeatResp, 2, 1, r.term))
            .unwrap();
        let msgs = read_messages(&mut r);
        assert!(snapshots_to(&msgs, 2).is_empty());
        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Probe);
        assert_eq!(pr.next_idx, 1);

        r.raft_log.store.wl().set_snapshot_unavailable(false);
        r.step(msg(MessageType::HeartbeatResp, 2, 1, r.term))
            .unwrap();
        let msgs = read_messages(&mut r);
        assert_eq!(snapshots_to(&msgs, 2).len(), 1);
        let pr = r.tracker().get(nid(2)).unwrap();
        assert_eq!(pr.state, ProgressState::Snapshot);
        assert_eq!(pr.pending_snapshot, 3);
    }

    #[test]
    fn test_snapshot_fast_forwards_matching_log() {
        let storage = new_storage(&[1, 2]);
        storage.wl().append(&[
            Entry::new(1, 1, Bytes::new()),
            Entry::new(1, 2, Bytes::new()),
        ]);
        let mut r = new_test_raft_with_config(&new_config(2, 10, 1), storage);
        r.become_follower(1, nid(1));

        let mut m = msg(MessageType::Snap, 1, 2, 1);
        m.snapshot = Some(Snapshot {
            data: Bytes::new(),
            metadata: SnapshotMetadata {
                conf_state: ConfState::with_voters([1, 2]),
                index: 2,
                term: 1,
            },
        });
        r.step(m).unwrap();

        // The log already holds the snapshot's last entry: commit it and
        // keep the log instead of replacing it.
        assert_eq!(r.raft_log.committed, 2);
        assert_eq!(r.raft_log.first_index(), 1);
        assert!(r.raft_log.next_unstable_snapshot().is_none());
        let msgs = read_messages(&mut r);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, MessageType::AppResp);
        assert_eq!(msgs[0].index, 2);
        assert!(!msgs[0].reject);
    }

    #[test]
    fn test_forget_leader() {
        let mut r = new_test_raft(2, &[1, 2], 10, 1);
        r.become_follower(1, nid(1));
        let forget = Message::new(MessageType::ForgetLeader, NodeId::NONE, NodeId::NONE);
        r.step(forget).unwrap();
        assert!(r.lead.is_none());
        assert_eq!(r.term, 1);
    }
}
