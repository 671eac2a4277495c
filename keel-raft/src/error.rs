//! Error types for the consensus core.
//!
//! Three classes of failure are kept apart:
//! - storage conditions reported by the [`Storage`](crate::Storage) collaborator, some of which
//!   are retryable;
//! - local validation errors returned to the caller without touching live state;
//! - fatal invariant violations, which panic instead of returning.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for consensus operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Conditions reported by the storage collaborator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// The requested index is older than the storage's first index.
    #[error("requested index is unavailable due to compaction")]
    Compacted,

    /// A snapshot older than the existing one was offered.
    #[error("requested index is older than the existing snapshot")]
    SnapshotOutOfDate,

    /// The requested entries are not (yet) available.
    #[error("requested entry at index is unavailable")]
    Unavailable,

    /// A snapshot is being built and cannot be served right now.
    #[error("snapshot is temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
}

impl StorageError {
    /// Returns true if the caller should simply try again later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::SnapshotTemporarilyUnavailable
        )
    }
}

/// Why a proposal was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No leader is known to forward the proposal to.
    NoLeader,
    /// Forwarding to the leader is disabled by configuration.
    ForwardingDisabled,
    /// The leader has been removed from the configuration.
    NotInConfiguration,
    /// A leadership transfer is in progress.
    LeadershipTransfer,
    /// Appending would exceed the uncommitted-entry byte budget.
    UncommittedSizeLimit,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::NoLeader => "no leader",
            Self::ForwardingDisabled => "proposal forwarding disabled",
            Self::NotInConfiguration => "leader not in configuration",
            Self::LeadershipTransfer => "leadership transfer in progress",
            Self::UncommittedSizeLimit => "uncommitted size limit reached",
        };
        f.write_str(reason)
    }
}

/// Errors returned by the consensus core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RaftError {
    /// The storage collaborator refused a request.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// A proposal was dropped; the caller may retry or fail fast.
    #[error("raft proposal dropped: {reason}")]
    ProposalDropped {
        /// Why the proposal was refused.
        reason: DropReason,
    },

    /// A local-only message was handed to `step` from outside.
    #[error("raft: cannot step raft local message")]
    StepLocalMsg,

    /// A response arrived from a peer that is not tracked.
    #[error("raft: cannot step as peer not found")]
    StepPeerNotFound,

    /// The node configuration is invalid.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A configuration change could not be applied.
    #[error("invalid conf change: {reason}")]
    ConfChange {
        /// What is wrong with it.
        reason: String,
    },

    /// An encoded record could not be decoded.
    #[error("malformed {what}")]
    Malformed {
        /// The record kind that failed to decode.
        what: &'static str,
    },

    /// Bootstrapping was refused.
    #[error("cannot bootstrap: {reason}")]
    Bootstrap {
        /// What prevented it.
        reason: &'static str,
    },
}

impl RaftError {
    /// Creates a conf change error from any displayable reason.
    pub fn conf_change(reason: impl Into<String>) -> Self {
        Self::ConfChange {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a retryable storage condition.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if a proposal was refused.
    #[must_use]
    pub const fn is_proposal_dropped(&self) -> bool {
        matches!(self, Self::ProposalDropped { .. })
    }
}
