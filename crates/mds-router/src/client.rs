//! The router's per-connection `Client` record (spec §3) and the internal
//! connection-sequence identifier used to key the client table before a
//! protocol [`ClientId`] has been assigned.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use bytes::{Bytes, BytesMut};
use mds_proto::{ClientId, Codec, Message};

use crate::matcher::{Condition, SubscriptionMatcher};
use crate::multicast::MulticastInProgress;

/// Internal sequence number identifying an accepted connection, independent
/// of the protocol-level [`ClientId`] (which a client may never be
/// assigned, or may request long after connecting). Conceptually this is
/// the router's analogue of a session id, kept distinct from the
/// user-visible id the way the substrate keeps connection identity
/// distinct from authenticated identity elsewhere in this codebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn:{}", self.0)
    }
}

impl ConnId {
    /// Reconstruct a connection id previously obtained via [`Self::raw`]
    /// (spec §4.F restoring a marshalled client table).
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// The raw sequence value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Allocates [`ConnId`]s in increasing order as connections are accepted.
#[derive(Debug, Default)]
pub struct ConnIdAllocator {
    next: AtomicU64,
}

impl ConnIdAllocator {
    /// Allocate the next connection id.
    pub fn allocate(&self) -> ConnId {
        ConnId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

/// One accepted connection's router-visible state (spec §3 "Client").
pub struct Client {
    conn_id: ConnId,
    /// The raw socket descriptor, kept only so it can be marshalled for
    /// re-exec (spec §4.B's "fd-keyed table"); `exec` preserves open file
    /// descriptors by number, so the new image only needs this integer to
    /// reopen the same socket as a [`std::os::unix::net::UnixStream`].
    fd: RawFd,
    open: AtomicBool,
    protocol_id: Mutex<Option<ClientId>>,
    matcher: Mutex<SubscriptionMatcher>,
    outbound: Mutex<VecDeque<Message>>,
    outbound_cv: Condvar,
    multicast_queue: Mutex<VecDeque<MulticastInProgress>>,
    multicast_cv: Condvar,
    pending_modification: Mutex<Option<Message>>,
    pending_cv: Condvar,
    /// This connection's in-flight frame parser, kept here (rather than as a
    /// reader-thread local) so its partial read buffer can be marshalled
    /// across a re-exec (spec §4.A).
    codec: Mutex<Codec>,
}

impl Client {
    /// A freshly accepted client: open, unassigned, no subscriptions.
    #[must_use]
    pub fn new(conn_id: ConnId, fd: RawFd) -> Self {
        Self {
            conn_id,
            fd,
            open: AtomicBool::new(true),
            protocol_id: Mutex::new(None),
            matcher: Mutex::new(SubscriptionMatcher::new()),
            outbound: Mutex::new(VecDeque::new()),
            outbound_cv: Condvar::new(),
            multicast_queue: Mutex::new(VecDeque::new()),
            multicast_cv: Condvar::new(),
            pending_modification: Mutex::new(None),
            pending_cv: Condvar::new(),
            codec: Mutex::new(Codec::new()),
        }
    }

    /// Restore a client exactly as it was marshalled (spec §4.F): same
    /// connection id, protocol id, fd, subscription conditions, pending
    /// outbound and multicast queues, and in-flight parse state, open and
    /// ready to resume exactly where it left off.
    #[must_use]
    pub fn restore(
        conn_id: ConnId,
        fd: RawFd,
        protocol_id: Option<ClientId>,
        conditions: Vec<Condition>,
        outbound: Vec<Message>,
        multicast_queue: Vec<MulticastInProgress>,
        codec: Codec,
    ) -> Self {
        Self {
            conn_id,
            fd,
            open: AtomicBool::new(true),
            protocol_id: Mutex::new(protocol_id),
            matcher: Mutex::new(SubscriptionMatcher::from_conditions(conditions)),
            outbound: Mutex::new(outbound.into()),
            outbound_cv: Condvar::new(),
            multicast_queue: Mutex::new(multicast_queue.into()),
            multicast_cv: Condvar::new(),
            pending_modification: Mutex::new(None),
            pending_cv: Condvar::new(),
            codec: Mutex::new(codec),
        }
    }

    /// The raw socket descriptor backing this connection.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// A clone of this client's current subscription conditions, for
    /// marshalling.
    #[must_use]
    pub fn conditions_snapshot(&self) -> Vec<Condition> {
        self.with_matcher(|matcher| matcher.conditions().to_vec())
    }

    /// This client's internal connection sequence id.
    #[must_use]
    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Whether this client is still eligible as a delivery target.
    ///
    /// Spec §3 invariant: a client with `open = false` is never chosen as a
    /// delivery target.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark this client closed. Idempotent.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// The protocol-level [`ClientId`], if one has been assigned.
    #[must_use]
    pub fn protocol_id(&self) -> Option<ClientId> {
        *self.protocol_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Assign a protocol-level id. Returns `false` if one is already set
    /// (spec §4.D.2: "if the client has no ID, allocate the next ID").
    pub fn assign_protocol_id(&self, id: ClientId) -> bool {
        let mut slot = self.protocol_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(id);
        true
    }

    /// Run `f` against this client's subscription matcher under its lock.
    pub fn with_matcher<R>(&self, f: impl FnOnce(&mut SubscriptionMatcher) -> R) -> R {
        let mut matcher = self.matcher.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut matcher)
    }

    /// Push a message to this client's outbound queue and wake anyone
    /// waiting to drain it.
    pub fn enqueue_outbound(&self, message: Message) {
        let mut queue = self.outbound.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.push_back(message);
        self.outbound_cv.notify_all();
    }

    /// Drain every currently queued outbound message.
    pub fn drain_outbound(&self) -> Vec<Message> {
        let mut queue = self.outbound.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.drain(..).collect()
    }

    /// A clone of the currently queued outbound messages, without removing
    /// them, for marshalling into a re-exec snapshot.
    #[must_use]
    pub fn outbound_snapshot(&self) -> Vec<Message> {
        let queue = self.outbound.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.iter().cloned().collect()
    }

    /// Append a new multicast-in-progress to this client's queue (it is the
    /// originator; spec §4.D.3 step 4).
    pub fn enqueue_multicast(&self, multicast: MulticastInProgress) {
        let mut queue =
            self.multicast_queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.push_back(multicast);
        self.multicast_cv.notify_all();
    }

    /// Take the front multicast-in-progress without removing it, so its
    /// delivery can be advanced in place; call [`Self::pop_front_multicast`]
    /// once it is fully drained.
    pub fn with_front_multicast<R>(
        &self,
        f: impl FnOnce(&mut MulticastInProgress) -> R,
    ) -> Option<R> {
        let mut queue =
            self.multicast_queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.front_mut().map(f)
    }

    /// Remove the front multicast-in-progress (it has fully drained).
    pub fn pop_front_multicast(&self) {
        let mut queue =
            self.multicast_queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.pop_front();
    }

    /// A clone of every multicast currently queued on this client, without
    /// removing them, for marshalling into a re-exec snapshot.
    #[must_use]
    pub fn multicast_queue_snapshot(&self) -> Vec<MulticastInProgress> {
        let queue =
            self.multicast_queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.iter().cloned().collect()
    }

    /// Run `f` against this client's frame parser under its lock; used by
    /// the reader loop to feed bytes and poll for complete messages.
    pub fn with_codec<R>(&self, f: impl FnOnce(&mut Codec) -> R) -> R {
        let mut codec = self.codec.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut codec)
    }

    /// This client's in-flight parse state, marshalled for a re-exec
    /// snapshot (spec §4.A).
    #[must_use]
    pub fn codec_snapshot(&self) -> Bytes {
        let codec = self.codec.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut buffer = BytesMut::with_capacity(mds_proto::codec::codec_marshal_size(&codec));
        mds_proto::codec::marshal_codec(&codec, &mut buffer);
        buffer.freeze()
    }

    /// Release any slack capacity this client's queues have accumulated
    /// (the reserved "danger" signal's low-memory response, spec §5).
    pub fn shrink_buffers(&self) {
        self.outbound.lock().unwrap_or_else(std::sync::PoisonError::into_inner).shrink_to_fit();
        self.multicast_queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .shrink_to_fit();
    }

    /// The number of subscriptions currently held by this client, for the
    /// reserved "info" signal's state dump.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.with_matcher(|matcher| matcher.conditions().len())
    }

    /// Deposit a modification reply into this client's pending slot and
    /// wake any thread waiting on it (spec §4.D.4 step 3's rendezvous).
    pub fn deposit_reply(&self, reply: Message) {
        let mut slot =
            self.pending_modification.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(reply);
        self.pending_cv.notify_all();
    }

    /// Block until a reply is deposited or `timeout` elapses, returning it
    /// if present. The 1-second bounded wait of spec §5 is the caller's
    /// responsibility — this method waits for exactly one `timeout` window
    /// and is meant to be called in a polling loop that also checks
    /// shutdown/re-exec flags between calls.
    pub fn wait_for_reply(&self, timeout: std::time::Duration) -> Option<Message> {
        let slot =
            self.pending_modification.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let (mut slot, _timeout_result) = self
            .pending_cv
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.take()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("conn_id", &self.conn_id)
            .field("open", &self.is_open())
            .field("protocol_id", &self.protocol_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn fresh_client_is_open_and_unassigned() {
        let client = Client::new(ConnIdAllocator::default().allocate(), -1);
        assert!(client.is_open());
        assert_eq!(client.protocol_id(), None);
    }

    #[test]
    fn assign_protocol_id_is_one_shot() {
        let client = Client::new(ConnIdAllocator::default().allocate(), -1);
        assert!(client.assign_protocol_id(ClientId::from_raw(1)));
        assert!(!client.assign_protocol_id(ClientId::from_raw(2)));
        assert_eq!(client.protocol_id(), Some(ClientId::from_raw(1)));
    }

    #[test]
    fn close_is_observed_via_is_open() {
        let client = Client::new(ConnIdAllocator::default().allocate(), -1);
        client.close();
        assert!(!client.is_open());
    }

    #[test]
    fn outbound_queue_round_trips() {
        let client = Client::new(ConnIdAllocator::default().allocate(), -1);
        client.enqueue_outbound(Message::new(mds_proto::HeaderList::new()));
        let drained = client.drain_outbound();
        assert_eq!(drained.len(), 1);
        assert!(client.drain_outbound().is_empty());
    }

    #[test]
    fn conn_id_allocator_increases() {
        let allocator = ConnIdAllocator::default();
        let a = allocator.allocate();
        let b = allocator.allocate();
        assert_ne!(a, b);
    }
}
