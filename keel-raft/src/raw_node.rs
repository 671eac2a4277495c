//! The driver-facing wrapper around [`Raft`].
//!
//! A `RawNode` is not thread-safe; the driver owns it and runs the loop:
//!
//! ```text
//! loop {
//!     tick / step / propose ...
//!     if node.has_ready() {
//!         let rd = node.ready();
//!         persist rd.hard_state, rd.entries, rd.snapshot
//!         send rd.messages
//!         apply rd.committed_entries
//!         node.advance();
//!     }
//! }
//! ```
//!
//! With asynchronous storage writes the persistence and apply steps are
//! instead described by `StorageAppend` and `StorageApply` messages in
//! `rd.messages`. Their `responses` are stepped back once the work is done,
//! and `advance` is never called.

use std::mem;

use bytes::Bytes;
use keel_core::NodeId;
use tracing::debug;

use crate::confchange::{ConfChange, ConfChangeType};
use crate::config::RaftConfig;
use crate::error::{RaftError, RaftResult};
use crate::message::{entries_size, ConfState, Entry, HardState, Message, MessageType};
use crate::ready::{must_sync, Ready};
use crate::state::{Raft, SoftState};
use crate::status::Status;
use crate::storage::Storage;

/// Outcome of a snapshot send reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// The snapshot was delivered.
    Finish,
    /// Delivery failed.
    Failure,
}

/// A member of the initial configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Peer ID.
    pub id: NodeId,
    /// Application context stored with its conf change entry.
    pub context: Bytes,
}

impl Peer {
    /// Creates a peer without context.
    #[must_use]
    pub const fn new(id: NodeId) -> Self {
        Self {
            id,
            context: Bytes::new(),
        }
    }
}

/// A [`Raft`] replica plus the bookkeeping needed to hand out [`Ready`]
/// batches.
pub struct RawNode<S: Storage> {
    raft: Raft<S>,
    async_storage_writes: bool,
    prev_soft_state: SoftState,
    prev_hard_state: HardState,
    /// Self-addressed messages to step once the accepted ready is handled.
    steps_on_advance: Vec<Message>,
}

impl<S: Storage> RawNode<S> {
    /// Creates a node over `store`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the persisted
    /// state cannot be loaded.
    pub fn new(config: &RaftConfig, store: S) -> RaftResult<Self> {
        let raft = Raft::new(config, store)?;
        let prev_soft_state = raft.soft_state();
        let prev_hard_state = raft.hard_state();
        Ok(Self {
            raft,
            async_storage_writes: config.async_storage_writes,
            prev_soft_state,
            prev_hard_state,
            steps_on_advance: Vec::new(),
        })
    }

    /// The wrapped state machine.
    #[must_use]
    pub const fn raft(&self) -> &Raft<S> {
        &self.raft
    }

    /// Mutable access to the wrapped state machine.
    pub fn raft_mut(&mut self) -> &mut Raft<S> {
        &mut self.raft
    }

    /// The storage collaborator.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.raft.raft_log.store
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) {
        self.raft.tick();
    }

    /// Advances only the election timer, sending nothing. Lets a driver
    /// quiesce idle groups without losing track of time.
    pub fn tick_quiesced(&mut self) {
        self.raft.tick_quiesced();
    }

    /// Starts an election.
    ///
    /// # Errors
    /// Propagates errors from stepping the local election message.
    pub fn campaign(&mut self) -> RaftResult<()> {
        self.raft
            .step(Message::new(MessageType::Hup, NodeId::NONE, NodeId::NONE))
    }

    /// Proposes `data` to be appended to the log.
    ///
    /// # Errors
    /// `ProposalDropped` if the proposal cannot be accepted right now.
    pub fn propose(&mut self, data: Bytes) -> RaftResult<()> {
        let mut m = Message::new(MessageType::Prop, self.raft.id, NodeId::NONE);
        m.entries = vec![Entry::new(0, 0, data)];
        self.raft.step(m)
    }

    /// Proposes a membership change.
    ///
    /// # Errors
    /// `ProposalDropped` if the proposal cannot be accepted right now.
    pub fn propose_conf_change(&mut self, cc: &ConfChange) -> RaftResult<()> {
        let mut m = Message::new(MessageType::Prop, NodeId::NONE, NodeId::NONE);
        m.entries = vec![cc.to_entry()];
        self.raft.step(m)
    }

    /// Applies a committed membership change. Must be called for every
    /// conf change entry once it is applied.
    ///
    /// # Errors
    /// `ConfChange` if the change is not valid for the current membership.
    pub fn apply_conf_change(&mut self, cc: &ConfChange) -> RaftResult<ConfState> {
        self.raft.apply_conf_change(cc)
    }

    /// Steps a message received from the network.
    ///
    /// # Errors
    /// `StepLocalMsg` for local-only messages not coming from a local
    /// thread, `StepPeerNotFound` for responses from untracked peers, and
    /// anything the state machine returns.
    pub fn step(&mut self, m: Message) -> RaftResult<()> {
        if m.msg_type.is_local() && !m.from.is_local_thread() {
            return Err(RaftError::StepLocalMsg);
        }
        if m.msg_type.is_response()
            && !m.from.is_local_thread()
            && self.raft.tracker().get(m.from).is_none()
        {
            return Err(RaftError::StepPeerNotFound);
        }
        self.raft.step(m)
    }

    /// Returns the pending ready batch and marks it as handed out.
    ///
    /// # Panics
    /// Panics in synchronous mode if the previous ready has not been
    /// advanced.
    pub fn ready(&mut self) -> Ready {
        let rd = self.ready_without_accept();
        self.accept_ready(&rd);
        rd
    }

    fn apply_unstable_entries(&self) -> bool {
        !self.async_storage_writes
    }

    fn ready_without_accept(&self) -> Ready {
        let raft = &self.raft;
        let mut rd = Ready {
            entries: raft.raft_log.next_unstable_ents().to_vec(),
            committed_entries: raft
                .raft_log
                .next_committed_ents(self.apply_unstable_entries()),
            messages: raft.msgs.clone(),
            ..Ready::default()
        };

        let soft_state = raft.soft_state();
        if soft_state != self.prev_soft_state {
            rd.soft_state = Some(soft_state);
        }
        let hard_state = raft.hard_state();
        if hard_state != self.prev_hard_state {
            rd.hard_state = Some(hard_state);
        }
        rd.snapshot = raft.raft_log.next_unstable_snapshot().cloned();
        rd.read_states.clone_from(&raft.read_states);
        rd.must_sync = must_sync(&hard_state, &self.prev_hard_state, rd.entries.len());

        if self.async_storage_writes {
            if self.need_storage_append_msg(&rd) {
                rd.messages.push(self.new_storage_append_msg(&rd));
            }
            if !rd.committed_entries.is_empty() {
                rd.messages.push(self.new_storage_apply_msg(&rd));
            }
        } else {
            // Self-addressed responses are stepped on advance instead.
            rd.messages.extend(
                raft.msgs_after_append
                    .iter()
                    .filter(|m| m.to != raft.id)
                    .cloned(),
            );
        }
        rd
    }

    fn need_storage_append_msg(&self, rd: &Ready) -> bool {
        !rd.entries.is_empty()
            || rd.hard_state.is_some_and(|hs| !hs.is_empty())
            || rd.snapshot.is_some()
            || !self.raft.msgs_after_append.is_empty()
    }

    fn need_storage_append_resp_msg(&self, rd: &Ready) -> bool {
        self.raft.raft_log.has_next_or_in_progress_unstable_ents() || rd.snapshot.is_some()
    }

    /// The acknowledgement of a storage append. Carries the log position
    /// that became durable so the log can drop its unstable copy.
    fn new_storage_append_resp_msg(&self, rd: &Ready) -> Message {
        let raft = &self.raft;
        let mut m = Message::new(
            MessageType::StorageAppendResp,
            NodeId::LOCAL_APPEND_THREAD,
            raft.id,
        );
        m.term = raft.term;
        if raft.raft_log.has_next_or_in_progress_unstable_ents() {
            m.index = raft.raft_log.last_index();
            m.log_term = raft.raft_log.last_term();
        }
        m.snapshot.clone_from(&rd.snapshot);
        m
    }

    fn new_storage_append_msg(&self, rd: &Ready) -> Message {
        let mut m = Message::new(
            MessageType::StorageAppend,
            self.raft.id,
            NodeId::LOCAL_APPEND_THREAD,
        );
        m.entries.clone_from(&rd.entries);
        if let Some(hs) = rd.hard_state.filter(|hs| !hs.is_empty()) {
            m.term = hs.term;
            m.vote = hs.vote;
            m.commit = hs.commit;
        }
        m.snapshot.clone_from(&rd.snapshot);
        // Sent once everything above is durable.
        m.responses.clone_from(&self.raft.msgs_after_append);
        if self.need_storage_append_resp_msg(rd) {
            m.responses.push(self.new_storage_append_resp_msg(rd));
        }
        m
    }

    fn new_storage_apply_resp_msg(&self, entries: Vec<Entry>) -> Message {
        // Committed entries are not applied under any particular term.
        let mut m = Message::new(
            MessageType::StorageApplyResp,
            NodeId::LOCAL_APPLY_THREAD,
            self.raft.id,
        );
        m.entries = entries;
        m
    }

    fn new_storage_apply_msg(&self, rd: &Ready) -> Message {
        let mut m = Message::new(
            MessageType::StorageApply,
            self.raft.id,
            NodeId::LOCAL_APPLY_THREAD,
        );
        m.entries.clone_from(&rd.committed_entries);
        let entries = rd.committed_entries.clone();
        m.responses.push(self.new_storage_apply_resp_msg(entries));
        m
    }

    fn accept_ready(&mut self, rd: &Ready) {
        if let Some(ss) = rd.soft_state {
            self.prev_soft_state = ss;
        }
        if let Some(hs) = rd.hard_state.filter(|hs| !hs.is_empty()) {
            self.prev_hard_state = hs;
        }
        if !rd.read_states.is_empty() {
            self.raft.read_states.clear();
        }

        if !self.async_storage_writes {
            assert!(
                self.steps_on_advance.is_empty(),
                "two accepted Ready structs without call to Advance"
            );
            let id = self.raft.id;
            self.steps_on_advance.extend(
                self.raft
                    .msgs_after_append
                    .iter()
                    .filter(|m| m.to == id)
                    .cloned(),
            );
            if self.need_storage_append_resp_msg(rd) {
                let m = self.new_storage_append_resp_msg(rd);
                self.steps_on_advance.push(m);
            }
            if !rd.committed_entries.is_empty() {
                let m = self.new_storage_apply_resp_msg(rd.committed_entries.clone());
                self.steps_on_advance.push(m);
            }
        }

        self.raft.msgs.clear();
        self.raft.msgs_after_append.clear();
        self.raft.raft_log.accept_unstable();
        if let Some(last) = rd.committed_entries.last() {
            let size = entries_size(&rd.committed_entries);
            let allow_unstable = self.apply_unstable_entries();
            self.raft
                .raft_log
                .accept_applying(last.index, size, allow_unstable);
        }
    }

    /// Returns true if a call to [`ready`](Self::ready) would return
    /// something worth handling.
    #[must_use]
    pub fn has_ready(&self) -> bool {
        let raft = &self.raft;
        if raft.soft_state() != self.prev_soft_state {
            return true;
        }
        let hard_state = raft.hard_state();
        if !hard_state.is_empty() && hard_state != self.prev_hard_state {
            return true;
        }
        raft.raft_log.has_next_unstable_snapshot()
            || !raft.msgs.is_empty()
            || !raft.msgs_after_append.is_empty()
            || raft.raft_log.has_next_unstable_ents()
            || raft
                .raft_log
                .has_next_committed_ents(self.apply_unstable_entries())
            || !raft.read_states.is_empty()
    }

    /// Signals that the last ready has been persisted, sent and applied.
    ///
    /// # Panics
    /// Panics when asynchronous storage writes are enabled; responses are
    /// stepped individually then.
    pub fn advance(&mut self) {
        assert!(
            !self.async_storage_writes,
            "advance must not be called when using async storage writes"
        );
        for m in mem::take(&mut self.steps_on_advance) {
            if let Err(e) = self.raft.step(m) {
                debug!(raft_id = %self.raft.id, error = %e, "error stepping message on advance");
            }
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        Status::new(&self.raft)
    }

    /// Reports that the last message to `id` could not be delivered.
    pub fn report_unreachable(&mut self, id: NodeId) {
        self.step_local(Message::new(MessageType::Unreachable, id, NodeId::NONE));
    }

    /// Reports the outcome of a snapshot sent to `id`.
    pub fn report_snapshot(&mut self, id: NodeId, status: SnapshotStatus) {
        let mut m = Message::new(MessageType::SnapStatus, id, NodeId::NONE);
        m.reject = status == SnapshotStatus::Failure;
        self.step_local(m);
    }

    /// Asks the leader to hand leadership to `transferee`.
    pub fn transfer_leader(&mut self, transferee: NodeId) {
        let m = Message::new(MessageType::TransferLeader, transferee, NodeId::NONE);
        self.step_local(m);
    }

    /// Requests a linearizable read. The result surfaces as a
    /// [`ReadState`](crate::ReadState) carrying `ctx` in a later ready.
    /// `ctx` must be unique among outstanding requests.
    pub fn read_index(&mut self, ctx: Bytes) {
        let mut m = Message::new(MessageType::ReadIndex, NodeId::NONE, NodeId::NONE);
        m.entries = vec![Entry::new(0, 0, ctx)];
        self.step_local(m);
    }

    /// Forgets the current leader, as if its lease expired. Ignored under
    /// lease-based reads.
    ///
    /// # Errors
    /// Propagates errors from the state machine.
    pub fn forget_leader(&mut self) -> RaftResult<()> {
        let m = Message::new(MessageType::ForgetLeader, NodeId::NONE, NodeId::NONE);
        self.raft.step(m)
    }

    fn step_local(&mut self, m: Message) {
        let msg_type = m.msg_type;
        if let Err(e) = self.raft.step(m) {
            debug!(
                raft_id = %self.raft.id,
                msg_type = ?msg_type,
                error = %e,
                "local message dropped"
            );
        }
    }

    /// Initializes empty storage with a configuration of `peers`.
    ///
    /// The conf change entries that add every peer are appended as if they
    /// had been committed in term 1 and the configuration is applied right
    /// away, so the node can campaign immediately. The entries still surface
    /// in the next ready to be persisted and applied.
    ///
    /// # Errors
    /// `Bootstrap` if `peers` is empty or the storage already holds entries.
    pub fn bootstrap(&mut self, peers: &[Peer]) -> RaftResult<()> {
        if peers.is_empty() {
            return Err(RaftError::Bootstrap {
                reason: "must provide at least one peer",
            });
        }
        if self.raft.raft_log.store.last_index()? != 0 {
            return Err(RaftError::Bootstrap {
                reason: "can't bootstrap a nonempty storage",
            });
        }

        // The bootstrap state differs from the empty state so that it is
        // persisted with the first ready.
        self.prev_hard_state = HardState::default();
        self.raft.become_follower(1, NodeId::NONE);

        let entries: Vec<Entry> = peers
            .iter()
            .zip(1..)
            .map(|(peer, index)| {
                let cc = ConfChange::LegacySingle {
                    change: crate::confchange::ConfChangeSingle::new(
                        ConfChangeType::AddNode,
                        peer.id.get(),
                    ),
                    context: peer.context.clone(),
                };
                Entry {
                    term: 1,
                    index,
                    ..cc.to_entry()
                }
            })
            .collect();
        self.raft.raft_log.append(&entries);
        self.raft.raft_log.committed = entries.len() as u64;

        for peer in peers {
            self.raft
                .apply_conf_change(&ConfChange::single(ConfChangeType::AddNode, peer.id.get()))?;
        }
        Ok(())
    }
}
