//! Peer identifiers.
//!
//! All IDs are 64-bit. A handful of values are reserved: `0` never names a
//! real peer, and the two highest values address the local storage threads
//! that acknowledge asynchronous appends and applies.

use std::fmt;

/// Identifier of a replica in a Raft group.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct NodeId(u64);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl NodeId {
    /// Placeholder for "no peer", e.g. no known leader or no vote cast.
    pub const NONE: Self = Self(0);

    /// Virtual target of storage-append requests when writes are asynchronous.
    pub const LOCAL_APPEND_THREAD: Self = Self(u64::MAX);

    /// Virtual target of apply requests when writes are asynchronous.
    pub const LOCAL_APPLY_THREAD: Self = Self(u64::MAX - 1);

    /// Wraps a raw peer ID.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true if this is the `NONE` placeholder.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns true if this names one of the local storage threads.
    #[inline]
    #[must_use]
    pub const fn is_local_thread(self) -> bool {
        self.0 == Self::LOCAL_APPEND_THREAD.0 || self.0 == Self::LOCAL_APPLY_THREAD.0
    }
}
