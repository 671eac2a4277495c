//! A simulated cluster of replicas driven through the ready/advance cycle.
//!
//! Each [`SimNode`] owns a [`RawNode`] over a [`MemoryStorage`] and behaves
//! like a synchronous driver: it persists every ready before sending its
//! messages, applies committed entries (including membership changes) and
//! then advances. Messages travel through a [`ChaoticNetwork`], so a run is
//! fully determined by its seed.
//!
//! # Crash model
//!
//! A crashed node loses its in-flight messages and its volatile state. Its
//! storage survives, and [`SimCluster::restart`] rebuilds the node from it.

use std::collections::BTreeMap;

use bytes::Bytes;
use keel_core::NodeId;
use keel_raft::{
    ConfChange, ConfState, Entry, MemoryStorage, Message, Raft, RaftConfig, RaftResult, RawNode,
    ReadState, Ready, StateRole,
};
use tracing::{debug, info, warn};

use crate::network::{ChaoticNetwork, NetworkMode};

/// Upper bound on deliveries in one call to [`SimCluster::deliver_all`].
const MAX_DELIVERIES: usize = 100_000;

/// One replica and its durable state.
pub struct SimNode {
    node: RawNode<MemoryStorage>,
    storage: MemoryStorage,
    config: RaftConfig,
    /// Applied entries by index.
    applied: BTreeMap<u64, Entry>,
    applied_index: u64,
    /// Reads served and not yet taken.
    read_states: Vec<ReadState>,
    crashed: bool,
}

impl SimNode {
    fn new(config: RaftConfig, storage: MemoryStorage) -> Self {
        let node = RawNode::new(&config, storage.clone()).expect("valid node config");
        Self {
            node,
            storage,
            config,
            applied: BTreeMap::new(),
            applied_index: 0,
            read_states: Vec::new(),
            crashed: false,
        }
    }

    /// The replica's ID.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.config.id
    }

    /// The wrapped state machine.
    #[must_use]
    pub const fn raft(&self) -> &Raft<MemoryStorage> {
        self.node.raft()
    }

    /// The driver handle.
    pub fn raw_node_mut(&mut self) -> &mut RawNode<MemoryStorage> {
        &mut self.node
    }

    /// The durable storage.
    #[must_use]
    pub const fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Returns true if the node is down.
    #[must_use]
    pub const fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// Current role.
    #[must_use]
    pub fn state(&self) -> StateRole {
        self.raft().state
    }

    /// Current term.
    #[must_use]
    pub fn term(&self) -> u64 {
        self.raft().term
    }

    /// Commit index.
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.raft().raft_log.committed
    }

    /// Index of the last log entry.
    #[must_use]
    pub fn last_index(&self) -> u64 {
        self.raft().raft_log.last_index()
    }

    /// Term of the entry at `index`, or 0 if the log does not hold it.
    #[must_use]
    pub fn term_at(&self, index: u64) -> u64 {
        let log = &self.raft().raft_log;
        log.zero_term_on_out_of_bounds(log.term(index))
    }

    /// Highest index handed to the application.
    #[must_use]
    pub const fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Entries handed to the application, by index.
    #[must_use]
    pub const fn applied(&self) -> &BTreeMap<u64, Entry> {
        &self.applied
    }

    /// Payloads of applied normal entries, in log order.
    #[must_use]
    pub fn applied_data(&self) -> Vec<Bytes> {
        self.applied
            .values()
            .filter(|e| !e.is_conf_change() && !e.data.is_empty())
            .map(|e| e.data.clone())
            .collect()
    }

    /// Takes the reads served since the last call.
    pub fn take_read_states(&mut self) -> Vec<ReadState> {
        std::mem::take(&mut self.read_states)
    }

    /// Drains every ready, returning the messages to send.
    fn process(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while self.node.has_ready() {
            let rd = self.node.ready();
            self.persist(&rd);
            let Ready {
                messages,
                committed_entries,
                snapshot,
                read_states,
                ..
            } = rd;
            self.read_states.extend(read_states);
            if let Some(snapshot) = snapshot {
                self.applied_index = self.applied_index.max(snapshot.metadata.index);
            }
            out.extend(messages);
            self.apply(committed_entries);
            self.node.advance();
        }
        out
    }

    fn persist(&self, rd: &Ready) {
        let mut core = self.storage.wl();
        if let Some(snapshot) = &rd.snapshot {
            if let Err(e) = core.apply_snapshot(snapshot.clone()) {
                warn!(node = %self.id(), error = %e, "snapshot not persisted");
            }
        }
        core.append(&rd.entries);
        if let Some(hs) = rd.hard_state {
            core.set_hard_state(hs);
        }
    }

    fn apply(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if entry.is_conf_change() {
                match ConfChange::decode(entry.entry_type, &entry.data)
                    .and_then(|cc| self.node.apply_conf_change(&cc))
                {
                    Ok(cs) => {
                        debug!(
                            node = %self.id(),
                            index = entry.index,
                            conf_state = ?cs,
                            "applied conf change"
                        );
                        self.storage.wl().set_conf_state(cs);
                    }
                    Err(e) => warn!(
                        node = %self.id(),
                        index = entry.index,
                        error = %e,
                        "conf change rejected"
                    ),
                }
            }
            self.applied_index = entry.index;
            self.applied.insert(entry.index, entry);
        }
    }
}

/// A group of replicas connected by a simulated network.
pub struct SimCluster {
    nodes: BTreeMap<NodeId, SimNode>,
    network: ChaoticNetwork,
}

impl SimCluster {
    /// Creates a cluster of voters `1..=n` over a reliable network.
    #[must_use]
    pub fn new(n: u64, seed: u64) -> Self {
        Self::with_config(n, seed, NetworkMode::Reliable, |c| c)
    }

    /// Creates a cluster of voters `1..=n`. `configure` adjusts each node's
    /// configuration before the node is built.
    #[must_use]
    pub fn with_config(
        n: u64,
        seed: u64,
        mode: NetworkMode,
        configure: impl Fn(RaftConfig) -> RaftConfig,
    ) -> Self {
        Self::build(n, 0, seed, mode, configure)
    }

    /// Creates a cluster of voters `1..=n` plus `spares` running nodes
    /// that are not members yet. Every node starts from the same initial
    /// membership, so spares join by membership change.
    #[must_use]
    pub fn with_spares(n: u64, spares: u64, seed: u64) -> Self {
        Self::build(n, spares, seed, NetworkMode::Reliable, |c| c)
    }

    fn build(
        voters: u64,
        spares: u64,
        seed: u64,
        mode: NetworkMode,
        configure: impl Fn(RaftConfig) -> RaftConfig,
    ) -> Self {
        let conf_state = ConfState::with_voters(1..=voters);
        let nodes = (1..=voters + spares)
            .map(|raw| {
                let id = NodeId::new(raw);
                let config = configure(
                    RaftConfig::new(id)
                        .with_ticks(10, 1)
                        .with_random_seed(seed.wrapping_add(raw)),
                );
                let storage = MemoryStorage::new_with_conf_state(conf_state.clone());
                (id, SimNode::new(config, storage))
            })
            .collect();
        info!(voters, spares, seed, ?mode, "cluster created");
        Self {
            nodes,
            network: ChaoticNetwork::new(seed, mode),
        }
    }

    /// IDs of every node, live or not.
    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Every node.
    pub fn nodes(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.values()
    }

    /// The node with ID `id`.
    ///
    /// # Panics
    /// Panics if there is no such node.
    #[must_use]
    pub fn node(&self, id: u64) -> &SimNode {
        &self.nodes[&NodeId::new(id)]
    }

    /// Mutable access to the node with ID `id`.
    ///
    /// # Panics
    /// Panics if there is no such node.
    pub fn node_mut(&mut self, id: u64) -> &mut SimNode {
        self.nodes.get_mut(&NodeId::new(id)).expect("node exists")
    }

    /// The network.
    pub fn network_mut(&mut self) -> &mut ChaoticNetwork {
        &mut self.network
    }

    /// Handles every pending ready on `id` and queues its messages.
    pub fn process(&mut self, id: NodeId) {
        let Some(sim) = self.nodes.get_mut(&id).filter(|n| !n.crashed) else {
            return;
        };
        let msgs = sim.process();
        self.network.send(msgs);
    }

    /// Ticks every live node once.
    pub fn tick_all(&mut self) {
        for id in self.ids() {
            if let Some(sim) = self.nodes.get_mut(&id).filter(|n| !n.crashed) {
                sim.node.tick();
            }
            self.process(id);
        }
    }

    /// Ticks `id` once.
    pub fn tick(&mut self, id: u64) {
        let id = NodeId::new(id);
        if let Some(sim) = self.nodes.get_mut(&id).filter(|n| !n.crashed) {
            sim.node.tick();
        }
        self.process(id);
    }

    /// Delivers one queued message. Returns false when the network is idle.
    pub fn deliver_one(&mut self) -> bool {
        let Some(m) = self.network.deliver_next() else {
            return false;
        };
        let to = m.to;
        if let Some(sim) = self.nodes.get_mut(&to).filter(|n| !n.crashed) {
            let msg_type = m.msg_type;
            if let Err(e) = sim.node.step(m) {
                debug!(node = %to, ?msg_type, error = %e, "step failed");
            }
            self.process(to);
        }
        true
    }

    /// Delivers messages until the network is idle. Returns the number of
    /// messages delivered.
    ///
    /// # Panics
    /// Panics if the cluster does not quiesce.
    pub fn deliver_all(&mut self) -> usize {
        let mut delivered = 0;
        while self.deliver_one() {
            delivered += 1;
            assert!(delivered < MAX_DELIVERIES, "cluster did not quiesce");
        }
        delivered
    }

    /// Makes `id` campaign and runs the election to completion.
    pub fn campaign(&mut self, id: u64) {
        let id = NodeId::new(id);
        if let Some(sim) = self.nodes.get_mut(&id).filter(|n| !n.crashed) {
            if let Err(e) = sim.node.campaign() {
                debug!(node = %id, error = %e, "campaign failed");
            }
        }
        self.process(id);
    }

    /// Elects `id` and waits for the cluster to settle.
    pub fn elect(&mut self, id: u64) {
        self.campaign(id);
        self.deliver_all();
    }

    /// Proposes `data` on `id`.
    ///
    /// # Errors
    /// Returns the error from the state machine, e.g. a dropped proposal.
    pub fn propose(&mut self, id: u64, data: &'static [u8]) -> RaftResult<()> {
        let id = NodeId::new(id);
        let result = self
            .nodes
            .get_mut(&id)
            .expect("node exists")
            .node
            .propose(Bytes::from_static(data));
        self.process(id);
        result
    }

    /// Proposes a membership change on `id`.
    ///
    /// # Errors
    /// Returns the error from the state machine.
    pub fn propose_conf_change(&mut self, id: u64, cc: &ConfChange) -> RaftResult<()> {
        let id = NodeId::new(id);
        let result = self
            .nodes
            .get_mut(&id)
            .expect("node exists")
            .node
            .propose_conf_change(cc);
        self.process(id);
        result
    }

    /// The live leader with the highest term.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| !n.crashed && n.state() == StateRole::Leader)
            .max_by_key(|n| n.term())
            .map(SimNode::id)
    }

    /// Ticks and delivers until some node leads, for at most `max_rounds`
    /// rounds. Returns the leader.
    pub fn wait_for_leader(&mut self, max_rounds: usize) -> Option<NodeId> {
        for _ in 0..max_rounds {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            self.tick_all();
            self.deliver_all();
        }
        self.leader()
    }

    /// Stops `id`. Its queued messages are lost; its storage survives.
    pub fn crash(&mut self, id: u64) {
        let id = NodeId::new(id);
        if let Some(sim) = self.nodes.get_mut(&id) {
            sim.crashed = true;
        }
        self.network.purge(id);
        info!(node = %id, "node crashed");
    }

    /// Rebuilds `id` from its storage.
    pub fn restart(&mut self, id: u64) {
        let id = NodeId::new(id);
        let Some(sim) = self.nodes.get_mut(&id) else {
            return;
        };
        let config = sim.config.clone().with_applied(sim.applied_index);
        sim.node = RawNode::new(&config, sim.storage.clone()).expect("restart from durable state");
        sim.crashed = false;
        info!(node = %id, applied = sim.applied_index, "node restarted");
        self.process(id);
    }

    /// Snapshots `id` at its applied index and discards the log up to it.
    /// Returns the snapshot index.
    ///
    /// # Panics
    /// Panics if nothing new was applied since the last compaction.
    pub fn compact(&mut self, id: u64) -> u64 {
        let sim = self.node_mut(id);
        let index = sim.applied_index;
        let mut core = sim.storage.wl();
        core.create_snapshot(index, None, Bytes::new())
            .expect("snapshot at the applied index");
        core.compact(index).expect("compact through the snapshot");
        info!(node = %sim.id(), index, "log compacted");
        index
    }

    /// Isolates `side` from the other nodes.
    pub fn partition(&mut self, side: &[u64]) {
        let side: Vec<_> = side.iter().copied().map(NodeId::new).collect();
        let all = self.ids();
        self.network.partition(&side, &all);
    }

    /// Reconnects every node.
    pub fn heal(&mut self) {
        self.network.heal();
    }
}
