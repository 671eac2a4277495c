//! Deterministic message network with fault injection.
//!
//! Messages sent by replicas are queued here and handed out one at a time.
//! In chaotic mode the network drops, duplicates and reorders messages using
//! a seeded RNG, so every run with the same seed delivers the same sequence.

use std::collections::{BTreeSet, VecDeque};

use keel_core::NodeId;
use keel_raft::Message;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Network behavior mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Messages are delivered exactly once, in send order.
    Reliable,
    /// Messages may be dropped, duplicated or reordered.
    Chaotic,
}

/// Delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Messages accepted for delivery.
    pub sent: u64,
    /// Messages handed to their recipient.
    pub delivered: u64,
    /// Messages lost to random drops.
    pub dropped: u64,
    /// Messages lost to partitions.
    pub partitioned: u64,
    /// Extra copies injected.
    pub duplicated: u64,
}

/// A queue of in-flight messages between replicas.
#[derive(Debug)]
pub struct ChaoticNetwork {
    mode: NetworkMode,
    rng: StdRng,
    in_flight: VecDeque<Message>,
    /// Directed pairs that cannot talk.
    cut: BTreeSet<(NodeId, NodeId)>,
    drop_probability: f64,
    duplicate_probability: f64,
    reorder_probability: f64,
    stats: NetworkStats,
}

impl ChaoticNetwork {
    /// Creates a network seeded with `seed`.
    #[must_use]
    pub fn new(seed: u64, mode: NetworkMode) -> Self {
        Self {
            mode,
            rng: StdRng::seed_from_u64(seed),
            in_flight: VecDeque::new(),
            cut: BTreeSet::new(),
            drop_probability: 0.05,
            duplicate_probability: 0.05,
            reorder_probability: 0.20,
            stats: NetworkStats::default(),
        }
    }

    /// Sets the fault probabilities used in chaotic mode.
    #[must_use]
    pub fn with_chaos(mut self, drop_prob: f64, duplicate_prob: f64, reorder_prob: f64) -> Self {
        self.drop_probability = drop_prob;
        self.duplicate_probability = duplicate_prob;
        self.reorder_probability = reorder_prob;
        self
    }

    /// Switches between reliable and chaotic delivery.
    pub fn set_mode(&mut self, mode: NetworkMode) {
        self.mode = mode;
    }

    /// Cuts every link between `side` and the rest of `all`, in both
    /// directions.
    pub fn partition(&mut self, side: &[NodeId], all: &[NodeId]) {
        for &a in side {
            for &b in all.iter().filter(|b| !side.contains(b)) {
                self.cut.insert((a, b));
                self.cut.insert((b, a));
            }
        }
    }

    /// Cuts the directed link from `from` to `to`.
    pub fn cut(&mut self, from: NodeId, to: NodeId) {
        self.cut.insert((from, to));
    }

    /// Restores every link.
    pub fn heal(&mut self) {
        self.cut.clear();
    }

    /// Returns true if messages from `from` to `to` are lost.
    #[must_use]
    pub fn is_cut(&self, from: NodeId, to: NodeId) -> bool {
        self.cut.contains(&(from, to))
    }

    /// Queues messages for delivery.
    pub fn send(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.stats.sent += 1;
            if self.is_cut(m.from, m.to) {
                self.stats.partitioned += 1;
                trace!(
                    from = %m.from,
                    to = %m.to,
                    msg_type = ?m.msg_type,
                    "message lost to partition"
                );
                continue;
            }
            if self.mode == NetworkMode::Chaotic {
                if self.rng.gen::<f64>() < self.drop_probability {
                    self.stats.dropped += 1;
                    trace!(from = %m.from, to = %m.to, msg_type = ?m.msg_type, "message dropped");
                    continue;
                }
                if self.rng.gen::<f64>() < self.duplicate_probability {
                    self.stats.duplicated += 1;
                    self.in_flight.push_back(m.clone());
                }
            }
            self.in_flight.push_back(m);
        }
    }

    /// Takes the next message to deliver, or `None` when the network is
    /// idle. In chaotic mode a random queued message may overtake the head.
    pub fn deliver_next(&mut self) -> Option<Message> {
        let len = self.in_flight.len();
        let idx = if self.mode == NetworkMode::Chaotic
            && len > 1
            && self.rng.gen::<f64>() < self.reorder_probability
        {
            self.rng.gen_range(0..len)
        } else {
            0
        };
        let m = self.in_flight.remove(idx)?;
        // Partitions raised after the send still apply.
        if self.is_cut(m.from, m.to) {
            self.stats.partitioned += 1;
            return self.deliver_next();
        }
        self.stats.delivered += 1;
        Some(m)
    }

    /// Discards every queued message addressed to or sent by `id`.
    pub fn purge(&mut self, id: NodeId) {
        self.in_flight.retain(|m| m.to != id && m.from != id);
    }

    /// Number of queued messages.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Delivery statistics so far.
    #[must_use]
    pub const fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Draws from the network's RNG, so that fault schedules chosen by the
    /// caller share the run's seed.
    pub fn gen_range(&mut self, range: std::ops::Range<usize>) -> usize {
        self.rng.gen_range(range)
    }
}
