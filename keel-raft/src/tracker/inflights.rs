//! Inflight window limiting unacknowledged appends to a single peer.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Inflight {
    index: u64,
    bytes: u64,
}

/// A bounded FIFO of in-flight append messages.
///
/// Each sent append records the last index it carried and its byte size.
/// The window is full once either the message count or the byte budget is
/// exhausted; acknowledgements free every message up to an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inflights {
    buffer: VecDeque<Inflight>,
    capacity: usize,
    bytes: u64,
    max_bytes: u64,
}

impl Inflights {
    /// Creates a window of `capacity` messages and `max_bytes` bytes.
    /// A `max_bytes` of zero disables the byte budget.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize, max_bytes: u64) -> Self {
        assert!(capacity > 0, "inflight capacity must be positive");
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            bytes: 0,
            max_bytes: if max_bytes == 0 { u64::MAX } else { max_bytes },
        }
    }

    /// Records an append whose last entry is `index`.
    ///
    /// # Panics
    /// Panics if the window is already full.
    pub fn add(&mut self, index: u64, bytes: u64) {
        assert!(!self.full(), "cannot add into a full inflights");
        if let Some(last) = self.buffer.back() {
            // Precondition: indexes are added in increasing order.
            debug_assert!(
                index > last.index,
                "inflight index {index} not after {}",
                last.index
            );
        }
        self.buffer.push_back(Inflight { index, bytes });
        self.bytes = self.bytes.saturating_add(bytes);

        // Postcondition: never more than capacity entries.
        debug_assert!(self.buffer.len() <= self.capacity);
    }

    /// Frees every in-flight message whose index is `<= to`.
    pub fn free_le(&mut self, to: u64) {
        while let Some(front) = self.buffer.front() {
            if front.index > to {
                break;
            }
            self.bytes -= front.bytes;
            self.buffer.pop_front();
        }
        if self.buffer.is_empty() {
            debug_assert_eq!(self.bytes, 0);
        }
    }

    /// Returns true if no more messages may be sent.
    #[must_use]
    pub fn full(&self) -> bool {
        self.buffer.len() >= self.capacity || self.bytes >= self.max_bytes
    }

    /// Number of in-flight messages.
    #[must_use]
    pub fn count(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes in flight.
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Configured message capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frees everything.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.bytes = 0;
    }
}
