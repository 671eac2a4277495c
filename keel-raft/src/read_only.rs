//! Linearizable reads without log writes.
//!
//! A read-index request records the leader's commit index at arrival. Under
//! [`ReadOnlyOption::Safe`] the leader then confirms it is still leader by
//! collecting heartbeat acknowledgements, tagged with the request context,
//! from a quorum. Once confirmed, every request queued up to and including
//! the acknowledged one is released.

use std::collections::{BTreeSet, HashMap, VecDeque};

use bytes::Bytes;
use keel_core::NodeId;

use crate::message::Message;

/// How read-only requests are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOnlyOption {
    /// Confirm leadership with a round of heartbeats. Always linearizable.
    #[default]
    Safe,
    /// Trust the leader lease. Depends on bounded clock drift and requires
    /// check-quorum.
    LeaseBased,
}

/// A served read: the application may read its state machine once it has
/// applied up to `index`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadState {
    /// Commit index at the time the request was received.
    pub index: u64,
    /// Context supplied with the request.
    pub request_ctx: Bytes,
}

impl ReadState {
    /// Creates a read state.
    #[must_use]
    pub const fn new(index: u64, request_ctx: Bytes) -> Self {
        Self { index, request_ctx }
    }
}

/// A read-index request waiting for quorum confirmation.
#[derive(Debug, Clone)]
pub struct ReadIndexStatus {
    /// The original `ReadIndex` message.
    pub req: Message,
    /// Commit index when the request arrived.
    pub index: u64,
    acks: BTreeSet<NodeId>,
}

/// Outstanding read-index requests.
#[derive(Debug, Clone, Default)]
pub struct ReadOnly {
    option: ReadOnlyOption,
    pending: HashMap<Bytes, ReadIndexStatus>,
    queue: VecDeque<Bytes>,
}

/// Context of a read-index request: the data of its single entry.
pub(crate) fn request_ctx(m: &Message) -> Bytes {
    m.entries
        .first()
        .map(|e| e.data.clone())
        .unwrap_or_default()
}

impl ReadOnly {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(option: ReadOnlyOption) -> Self {
        Self {
            option,
            pending: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// How reads are served.
    #[must_use]
    pub const fn option(&self) -> ReadOnlyOption {
        self.option
    }

    /// Queues a request received when the commit index was `index`.
    /// Duplicate contexts are ignored.
    pub fn add_request(&mut self, index: u64, req: Message) {
        let ctx = request_ctx(&req);
        if self.pending.contains_key(&ctx) {
            return;
        }
        self.pending.insert(
            ctx.clone(),
            ReadIndexStatus {
                req,
                index,
                acks: BTreeSet::new(),
            },
        );
        self.queue.push_back(ctx);
    }

    /// Records a heartbeat acknowledgement from `id` carrying `ctx` and
    /// returns everyone who has acknowledged that request so far.
    pub fn recv_ack(&mut self, id: NodeId, ctx: &[u8]) -> Option<&BTreeSet<NodeId>> {
        let status = self.pending.get_mut(ctx)?;
        status.acks.insert(id);
        Some(&status.acks)
    }

    /// Releases every request queued up to and including the one whose
    /// context `m` carries, oldest first.
    ///
    /// # Panics
    /// Panics if the queue and the pending map disagree.
    pub fn advance(&mut self, m: &Message) -> Vec<ReadIndexStatus> {
        let Some(pos) = self.queue.iter().position(|ctx| *ctx == m.context) else {
            return Vec::new();
        };

        self.queue
            .drain(..=pos)
            .map(|ctx| match self.pending.remove(&ctx) {
                Some(status) => status,
                None => panic!("cannot find corresponding read state from pending map"),
            })
            .collect()
    }

    /// Context of the newest pending request, or empty if none.
    #[must_use]
    pub fn last_pending_request_ctx(&self) -> Bytes {
        self.queue.back().cloned().unwrap_or_default()
    }

    /// Number of pending requests.
    #[must_use]
    pub fn pending_read_count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Entry, MessageType};

    fn read_req(ctx: &'static [u8]) -> Message {
        let mut m = Message::new(MessageType::ReadIndex, NodeId::new(2), NodeId::NONE);
        m.entries = vec![Entry::new(0, 0, Bytes::from_static(ctx))];
        m
    }

    fn heartbeat_resp(ctx: &'static [u8]) -> Message {
        let mut m = Message::new(MessageType::HeartbeatResp, NodeId::new(2), NodeId::new(1));
        m.context = Bytes::from_static(ctx);
        m
    }

    #[test]
    fn test_add_request_ignores_duplicates() {
        let mut ro = ReadOnly::new(ReadOnlyOption::Safe);
        ro.add_request(5, read_req(b"a"));
        ro.add_request(7, read_req(b"a"));
        assert_eq!(ro.pending_read_count(), 1);
        assert_eq!(ro.last_pending_request_ctx(), Bytes::from_static(b"a"));
    }

    #[test]
    fn test_recv_ack_accumulates() {
        let mut ro = ReadOnly::new(ReadOnlyOption::Safe);
        assert!(ro.recv_ack(NodeId::new(1), b"missing").is_none());

        ro.add_request(5, read_req(b"a"));
        ro.recv_ack(NodeId::new(1), b"a");
        ro.recv_ack(NodeId::new(2), b"a");
        let acks = ro.recv_ack(NodeId::new(2), b"a").unwrap();
        assert_eq!(acks.len(), 2);
    }

    #[test]
    fn test_advance_releases_prefix() {
        let mut ro = ReadOnly::new(ReadOnlyOption::Safe);
        ro.add_request(1, read_req(b"a"));
        ro.add_request(2, read_req(b"b"));
        ro.add_request(3, read_req(b"c"));

        let released = ro.advance(&heartbeat_resp(b"b"));
        let indexes: Vec<u64> = released.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![1, 2]);
        assert_eq!(ro.pending_read_count(), 1);
        assert_eq!(ro.last_pending_request_ctx(), Bytes::from_static(b"c"));

        // Unknown context releases nothing.
        assert!(ro.advance(&heartbeat_resp(b"zz")).is_empty());
        assert_eq!(ro.pending_read_count(), 1);
    }

    #[test]
    fn test_empty_tracker() {
        let ro = ReadOnly::new(ReadOnlyOption::LeaseBased);
        assert_eq!(ro.option(), ReadOnlyOption::LeaseBased);
        assert!(ro.last_pending_request_ctx().is_empty());
    }
}
