//! Monotonic identifier allocation: client IDs and modify-ticket IDs
//! (spec §3).
//!
//! Both counters are 64-bit and start at `1` in their low half so the very
//! first client ID displays as `1:1` (spec §8 scenario 1 works this
//! example through explicitly). `0:0` stays reserved for the anonymous
//! client and is never handed out. Overflow of either counter is a fatal
//! invariant violation, not a recoverable error — the spec explicitly
//! permits refusing to wrap rather than reusing an ID.

use mds_proto::ClientId;

use crate::error::CoreError;

const FIRST_ID: u64 = (1u64 << 32) | 1;

/// Allocates client IDs in increasing order, starting at `1:1`.
#[derive(Debug)]
pub struct ClientIdAllocator {
    next: u64,
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientIdAllocator {
    /// A fresh allocator that will hand out `1:1` first.
    #[must_use]
    pub fn new() -> Self {
        Self { next: FIRST_ID }
    }

    /// Restore an allocator mid-sequence, e.g. after re-exec.
    #[must_use]
    pub fn resume_from(next_raw: u64) -> Self {
        Self { next: next_raw }
    }

    /// The raw value of the next ID that would be allocated; used when
    /// marshalling this allocator's state.
    #[must_use]
    pub fn peek_next(&self) -> u64 {
        self.next
    }

    /// Allocate and return the next client ID.
    ///
    /// # Errors
    ///
    /// [`CoreError::CounterOverflow`] if the counter has been exhausted.
    pub fn allocate(&mut self) -> Result<ClientId, CoreError> {
        if self.next == u64::MAX {
            return Err(CoreError::CounterOverflow { counter: "client id" });
        }
        let id = ClientId::from_raw(self.next);
        self.next += 1;
        Ok(id)
    }
}

/// A monotonic modify-rendezvous ticket identifier (spec §3, §4.D.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId(u64);

impl TicketId {
    /// Reconstruct a ticket id from the raw value a reply echoes back over
    /// the wire (a `Modify ID` header only ever carries a value this
    /// process itself allocated).
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates modify-ticket IDs in increasing order starting at `1`.
///
/// Spec §4.D.4: "a new ID is assigned only after the previous multicast is
/// fully completed or abandoned" — that sequencing is the caller's
/// responsibility (one ticket outstanding per in-flight modifying
/// multicast); this type only guarantees uniqueness and order.
#[derive(Debug)]
pub struct TicketIdAllocator {
    next: u64,
}

impl Default for TicketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketIdAllocator {
    /// A fresh allocator that will hand out ticket `1` first.
    #[must_use]
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Restore an allocator mid-sequence, e.g. after re-exec.
    #[must_use]
    pub fn resume_from(next: u64) -> Self {
        Self { next }
    }

    /// The raw value of the next ticket that would be allocated.
    #[must_use]
    pub fn peek_next(&self) -> u64 {
        self.next
    }

    /// Allocate and return the next ticket ID.
    ///
    /// # Errors
    ///
    /// [`CoreError::CounterOverflow`] if the counter has been exhausted.
    pub fn allocate(&mut self) -> Result<TicketId, CoreError> {
        if self.next == u64::MAX {
            return Err(CoreError::CounterOverflow { counter: "modify ticket" });
        }
        let id = TicketId(self.next);
        self.next += 1;
        Ok(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn first_two_client_ids_match_spec_scenario() {
        let mut allocator = ClientIdAllocator::new();
        assert_eq!(allocator.allocate().unwrap().to_string(), "1:1");
        assert_eq!(allocator.allocate().unwrap().to_string(), "1:2");
    }

    #[test]
    fn client_id_overflow_is_fatal() {
        let mut allocator = ClientIdAllocator::resume_from(u64::MAX);
        assert!(matches!(allocator.allocate(), Err(CoreError::CounterOverflow { .. })));
    }

    #[test]
    fn ticket_ids_increase_from_one() {
        let mut allocator = TicketIdAllocator::new();
        assert_eq!(allocator.allocate().unwrap().raw(), 1);
        assert_eq!(allocator.allocate().unwrap().raw(), 2);
    }
}
