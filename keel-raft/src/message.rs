//! Protocol records: messages, log entries, snapshots and persisted state.
//!
//! The wire encoding is left to the transport; these are plain structured
//! records carrying exactly the fields the state machine reads and writes.

use bytes::Bytes;
use keel_core::NodeId;

/// Message kinds exchanged between replicas or fed in locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    /// Local: start an election.
    #[default]
    Hup,
    /// Local: broadcast heartbeats (leader only).
    Beat,
    /// Proposal of new entries.
    Prop,
    /// Append entries.
    App,
    /// Response to `App`.
    AppResp,
    /// Vote request.
    Vote,
    /// Response to `Vote`.
    VoteResp,
    /// Snapshot installation.
    Snap,
    /// Heartbeat.
    Heartbeat,
    /// Response to `Heartbeat`.
    HeartbeatResp,
    /// Local: a peer could not be reached.
    Unreachable,
    /// Local: outcome of a snapshot send.
    SnapStatus,
    /// Local: verify a quorum is still active (leader only).
    CheckQuorum,
    /// Request a leadership transfer.
    TransferLeader,
    /// Tell the transferee to campaign immediately.
    TimeoutNow,
    /// Linearizable read request.
    ReadIndex,
    /// Response to `ReadIndex`.
    ReadIndexResp,
    /// Pre-vote request.
    PreVote,
    /// Response to `PreVote`.
    PreVoteResp,
    /// Local: persist entries and state (asynchronous storage writes).
    StorageAppend,
    /// Local: acknowledgement of `StorageAppend`.
    StorageAppendResp,
    /// Local: apply committed entries (asynchronous storage writes).
    StorageApply,
    /// Local: acknowledgement of `StorageApply`.
    StorageApplyResp,
    /// Forget the current leader.
    ForgetLeader,
}

impl MessageType {
    /// Returns true for messages that never travel over the network.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(
            self,
            Self::Hup
                | Self::Beat
                | Self::Unreachable
                | Self::SnapStatus
                | Self::CheckQuorum
                | Self::StorageAppend
                | Self::StorageAppendResp
                | Self::StorageApply
                | Self::StorageApplyResp
        )
    }

    /// Returns true for responses to a peer request.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Self::AppResp
                | Self::VoteResp
                | Self::HeartbeatResp
                | Self::Unreachable
                | Self::ReadIndexResp
                | Self::PreVoteResp
                | Self::StorageAppendResp
                | Self::StorageApplyResp
        )
    }

    /// Returns the response type for a vote or pre-vote request.
    ///
    /// # Panics
    /// Panics if called on a non-vote message type.
    #[must_use]
    pub fn vote_response(self) -> Self {
        match self {
            Self::Vote => Self::VoteResp,
            Self::PreVote => Self::PreVoteResp,
            other => panic!("not a vote message: {other:?}"),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Message kind.
    pub msg_type: MessageType,
    /// Recipient.
    pub to: NodeId,
    /// Sender.
    pub from: NodeId,
    /// Sender's term; `0` for local messages and unstamped proposals.
    pub term: u64,
    /// Term of the entry at `index` (appends) or the sender's last entry (votes).
    pub log_term: u64,
    /// Log position the message refers to.
    pub index: u64,
    /// Entries carried by appends, proposals and storage messages.
    pub entries: Vec<Entry>,
    /// Sender's commit index.
    pub commit: u64,
    /// Sender's vote (storage-append messages only).
    pub vote: NodeId,
    /// Snapshot carried by `Snap` and storage messages.
    pub snapshot: Option<Snapshot>,
    /// True if the request was rejected.
    pub reject: bool,
    /// Rejection hint: the index the follower suggests probing next.
    pub reject_hint: u64,
    /// Opaque context (read-index request IDs, campaign markers).
    pub context: Bytes,
    /// Messages to deliver once a storage request completes.
    pub responses: Vec<Message>,
}

impl Message {
    /// Creates a message of the given type between two peers.
    #[must_use]
    pub fn new(msg_type: MessageType, from: NodeId, to: NodeId) -> Self {
        Self {
            msg_type,
            from,
            to,
            ..Self::default()
        }
    }
}

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryType {
    /// Application payload.
    #[default]
    Normal,
    /// A single (legacy) configuration change.
    ConfChange,
    /// A configuration change that may require joint consensus.
    ConfChangeV2,
}

/// A log entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    /// Term in which the entry was proposed.
    pub term: u64,
    /// Position in the log.
    pub index: u64,
    /// Payload kind.
    pub entry_type: EntryType,
    /// Opaque payload (or an encoded conf change).
    pub data: Bytes,
}

impl Entry {
    /// Creates a normal entry.
    #[must_use]
    pub const fn new(term: u64, index: u64, data: Bytes) -> Self {
        Self {
            term,
            index,
            entry_type: EntryType::Normal,
            data,
        }
    }

    /// Returns true if the entry carries a configuration change.
    #[must_use]
    pub const fn is_conf_change(&self) -> bool {
        matches!(
            self.entry_type,
            EntryType::ConfChange | EntryType::ConfChangeV2
        )
    }

    /// Size accounted against the uncommitted-entry budget.
    ///
    /// Only the payload counts, so empty leader entries are always admitted.
    #[must_use]
    pub fn payload_size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Approximate encoded size, used for message and batch limits.
    #[must_use]
    pub fn size(&self) -> u64 {
        // term + index + type tag
        17 + self.data.len() as u64
    }
}

/// Total payload size of a batch of entries.
#[must_use]
pub fn payloads_size(entries: &[Entry]) -> u64 {
    entries.iter().map(Entry::payload_size).sum()
}

/// Total approximate encoded size of a batch of entries.
#[must_use]
pub fn entries_size(entries: &[Entry]) -> u64 {
    entries.iter().map(Entry::size).sum()
}

/// Truncates `entries` to fit `max_size` bytes, always keeping at least one.
pub fn limit_size(entries: &mut Vec<Entry>, max_size: u64) {
    if entries.len() <= 1 {
        return;
    }
    let mut size = 0;
    let keep = entries
        .iter()
        .take_while(|e| {
            size += e.size();
            size <= max_size
        })
        .count();
    entries.truncate(keep.max(1));
}

/// Membership as recorded in snapshots and reported after conf changes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfState {
    /// Voters of the incoming (or only) configuration.
    pub voters: Vec<NodeId>,
    /// Learners.
    pub learners: Vec<NodeId>,
    /// Voters of the outgoing configuration; empty unless joint.
    pub voters_outgoing: Vec<NodeId>,
    /// Peers that become learners once the joint configuration is left.
    pub learners_next: Vec<NodeId>,
    /// Leave the joint configuration automatically once it commits.
    pub auto_leave: bool,
}

impl ConfState {
    /// Creates a simple configuration of the given voters.
    #[must_use]
    pub fn with_voters(voters: impl IntoIterator<Item = u64>) -> Self {
        Self {
            voters: voters.into_iter().map(NodeId::new).collect(),
            ..Self::default()
        }
    }

    /// Compares two states ignoring element order.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        fn sorted(ids: &[NodeId]) -> Vec<NodeId> {
            let mut ids = ids.to_vec();
            ids.sort_unstable();
            ids
        }
        sorted(&self.voters) == sorted(&other.voters)
            && sorted(&self.learners) == sorted(&other.learners)
            && sorted(&self.voters_outgoing) == sorted(&other.voters_outgoing)
            && sorted(&self.learners_next) == sorted(&other.learners_next)
            && self.auto_leave == other.auto_leave
    }
}

/// Metadata describing the log prefix a snapshot replaces.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// Membership at `index`.
    pub conf_state: ConfState,
    /// Last index covered by the snapshot.
    pub index: u64,
    /// Term of the entry at `index`.
    pub term: u64,
}

/// A state machine snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Opaque application state.
    pub data: Bytes,
    /// What the snapshot covers.
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    /// Returns true for the zero snapshot.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

/// State that must be persisted before messages depending on it are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardState {
    /// Current term.
    pub term: u64,
    /// Vote cast in `term`.
    pub vote: NodeId,
    /// Highest index known to be committed.
    pub commit: u64,
}

impl HardState {
    /// Returns true for the zero hard state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
