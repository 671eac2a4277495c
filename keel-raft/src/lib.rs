//! Keel Raft - the consensus core of a single replica.
//!
//! [`Raft`] is a deterministic state machine: it consumes messages and
//! ticks and produces messages, log writes and read states, but performs no
//! I/O. [`RawNode`] wraps it for a driver, which persists and sends what
//! each [`Ready`] describes.
//!
//! Membership changes go through joint consensus (see [`confchange`]);
//! replication to each peer is flow-controlled by its [`Progress`].
//!
//! # Design Principles
//!
//! - **Deterministic**: all randomness comes from a seeded RNG; every map
//!   that drives message emission is ordered
//! - **Validate, then swap**: configuration changes are computed on a copy
//!   and installed only once they pass the invariant checks
//! - **Fail loudly**: invariant violations panic; only conditions a caller
//!   can act on are returned as errors
//! - **No unsafe code**

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod confchange;
mod config;
mod error;
mod log;
mod message;
pub mod quorum;
mod raw_node;
mod read_only;
mod ready;
mod state;
mod status;
mod step;
mod storage;
pub mod tracker;

#[cfg(test)]
mod test_util;

pub use confchange::{
    conf_changes_from_string, conf_changes_to_string, ConfChange, ConfChangeSingle,
    ConfChangeTransition, ConfChangeType,
};
pub use config::RaftConfig;
pub use error::{DropReason, RaftError, RaftResult, StorageError, StorageResult};
pub use log::{RaftLog, Unstable};
pub use message::{
    entries_size, limit_size, payloads_size, ConfState, Entry, EntryType, HardState, Message,
    MessageType, Snapshot, SnapshotMetadata,
};
pub use raw_node::{Peer, RawNode, SnapshotStatus};
pub use read_only::{ReadOnly, ReadOnlyOption, ReadState};
pub use ready::{must_sync, Ready};
pub use state::{Raft, SoftState, StateRole};
pub use status::Status;
pub use storage::{MemoryStorage, MemoryStorageCore, RaftState, Storage};
pub use tracker::{Inflights, Progress, ProgressState, ProgressTracker};

/// Configuration defaults and limits.
pub mod limits {
    /// Default election timeout, in ticks.
    pub const ELECTION_TICK_DEFAULT: usize = 10;

    /// Default heartbeat interval, in ticks.
    pub const HEARTBEAT_TICK_DEFAULT: usize = 1;

    /// Default number of in-flight append messages per peer.
    pub const MAX_INFLIGHT_MSGS_DEFAULT: usize = 256;

    /// Default byte budget of a single append message.
    pub const MAX_SIZE_PER_MSG_DEFAULT: u64 = 1024 * 1024;

    /// Value of a byte budget that is unlimited.
    pub const NO_LIMIT: u64 = u64::MAX;
}
