//! The central [`Router`]: the client table, the modify-rendezvous map, and
//! the shared counters, all guarded per spec §5's locking order — the
//! client-list mutex is always acquired before any per-client lock, and
//! counters are allocated while already holding it so a concurrent re-exec
//! snapshot sees a consistent pair of (clients, next-id) values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use mds_core::{ClientIdAllocator, TicketId, TicketIdAllocator};
use mds_proto::{ClientId, Message};

use crate::client::{Client, ConnId, ConnIdAllocator};
use crate::dispatch::{self, DispatchKind};
use crate::error::DispatchError;
use crate::multicast::{sort_matches, strip_modify_id, Match, MulticastInProgress};

/// A snapshot of router state for the reserved "info" signal's log line
/// (spec §5); not part of the wire protocol.
#[derive(Debug, Clone, Copy)]
pub struct RouterStateSummary {
    /// Currently registered connections.
    pub clients: usize,
    /// Sum of every client's subscription count.
    pub subscriptions: usize,
    /// Modify replies the router is currently waiting on.
    pub pending_rendezvous: usize,
}

/// Everything the router needs to hold for the lifetime of one process
/// incarnation (spec §4.D, §4.F's unit of re-exec state).
pub struct Router {
    conn_ids: ConnIdAllocator,
    /// Guards the client table and, transitively, the two counters below —
    /// spec §5's single "client list" mutex.
    clients: Mutex<HashMap<ConnId, Arc<Client>>>,
    client_ids: Mutex<ClientIdAllocator>,
    tickets: Mutex<TicketIdAllocator>,
    /// Which connection is expected to answer a given outstanding ticket.
    rendezvous: Mutex<HashMap<TicketId, ConnId>>,
    rendezvous_cv: Condvar,
    terminating: AtomicBool,
    reexecing: AtomicBool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// A router with no clients and fresh counters, as at an initial spawn.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conn_ids: ConnIdAllocator::default(),
            clients: Mutex::new(HashMap::new()),
            client_ids: Mutex::new(ClientIdAllocator::new()),
            tickets: Mutex::new(TicketIdAllocator::new()),
            rendezvous: Mutex::new(HashMap::new()),
            rendezvous_cv: Condvar::new(),
            terminating: AtomicBool::new(false),
            reexecing: AtomicBool::new(false),
        }
    }

    /// Restore a router whose counters resume mid-sequence and whose
    /// modify-rendezvous map is repopulated from a prior snapshot (spec
    /// §4.F re-exec, spec §8's rendezvous-map survival property); the
    /// client table itself is rebuilt by the caller as connections are
    /// re-registered, since raw sockets don't survive marshalling.
    #[must_use]
    pub fn resume(
        next_client_id: u64,
        next_ticket: u64,
        rendezvous: HashMap<TicketId, ConnId>,
    ) -> Self {
        Self {
            conn_ids: ConnIdAllocator::default(),
            clients: Mutex::new(HashMap::new()),
            client_ids: Mutex::new(ClientIdAllocator::resume_from(next_client_id)),
            tickets: Mutex::new(TicketIdAllocator::resume_from(next_ticket)),
            rendezvous: Mutex::new(rendezvous),
            rendezvous_cv: Condvar::new(),
            terminating: AtomicBool::new(false),
            reexecing: AtomicBool::new(false),
        }
    }

    /// Register a freshly accepted connection and return its new client
    /// record.
    pub fn register(&self, fd: std::os::fd::RawFd) -> Arc<Client> {
        let conn_id = self.conn_ids.allocate();
        let client = Arc::new(Client::new(conn_id, fd));
        let mut clients = self.clients.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clients.insert(conn_id, Arc::clone(&client));
        client
    }

    /// Re-register a client restored from a re-exec snapshot, keeping its
    /// original connection id, protocol id, fd, and subscriptions
    /// (spec §4.F step 5).
    pub fn reregister(&self, client: Arc<Client>) {
        let mut clients = self.clients.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clients.insert(client.conn_id(), client);
    }

    /// Remove a connection from the table once its reader thread has
    /// exited. The caller is responsible for having already marked it
    /// closed and fanned out `Client closed` (spec §4.D.1).
    pub fn deregister(&self, conn_id: ConnId) {
        let mut clients = self.clients.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clients.remove(&conn_id);
    }

    /// Look a client up by its internal connection id.
    #[must_use]
    pub fn client(&self, conn_id: ConnId) -> Option<Arc<Client>> {
        let clients = self.clients.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clients.get(&conn_id).cloned()
    }

    /// A snapshot of every currently registered client, taken under the
    /// client-list lock only long enough to clone the `Arc`s (spec §4.D.3
    /// step 1: the scan itself happens lock-free against these clones).
    #[must_use]
    pub fn snapshot_clients(&self) -> Vec<Arc<Client>> {
        let clients = self.clients.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        clients.values().cloned().collect()
    }

    /// The raw next-client-id and next-ticket counters, for marshalling into
    /// a re-exec snapshot (spec §4.F).
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        let next_client_id =
            self.client_ids.lock().unwrap_or_else(std::sync::PoisonError::into_inner).peek_next();
        let next_ticket =
            self.tickets.lock().unwrap_or_else(std::sync::PoisonError::into_inner).peek_next();
        (next_client_id, next_ticket)
    }

    /// Every ticket currently awaiting a modify reply, paired with the
    /// connection expected to answer it, for marshalling into a re-exec
    /// snapshot (spec §8's rendezvous-map survival property).
    #[must_use]
    pub fn rendezvous_snapshot(&self) -> Vec<(TicketId, ConnId)> {
        let pending = self.rendezvous.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.iter().map(|(&ticket, &conn_id)| (ticket, conn_id)).collect()
    }

    /// Whether the process is shutting down (no new work should be
    /// accepted).
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Mark the process as terminating.
    pub fn begin_terminating(&self) {
        self.terminating.store(true, Ordering::Release);
    }

    /// Whether a re-exec has been requested (reader threads should drain and
    /// park rather than keep blocking on reads).
    #[must_use]
    pub fn is_reexecing(&self) -> bool {
        self.reexecing.load(Ordering::Acquire)
    }

    /// Mark the process as re-execing.
    pub fn begin_reexecing(&self) {
        self.reexecing.store(true, Ordering::Release);
    }

    /// Run one inbound message through dispatch (spec §4.D.2-D.4) on behalf
    /// of `sender`.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] scoped to `sender`'s connection; per
    /// spec §7 this must never be allowed to affect any other client.
    pub fn dispatch(&self, sender: &Arc<Client>, message: Message) -> Result<(), DispatchError> {
        match dispatch::classify(&message)? {
            DispatchKind::AssignId => {
                // Spec §4.D.2: "Regardless, continue with multicast" — the
                // assign-id command is also multicast to any subscriber
                // interested in it, same as an application verb.
                self.handle_assign_id(sender, &message)?;
                self.handle_multicast(sender, message)
            },
            DispatchKind::Intercept => self.handle_intercept(sender, &message),
            DispatchKind::ModifyReply { ticket } => {
                self.handle_modify_reply(ticket, message);
                Ok(())
            },
            DispatchKind::Multicast => self.handle_multicast(sender, message),
        }
    }

    fn handle_assign_id(
        &self,
        sender: &Arc<Client>,
        message: &Message,
    ) -> Result<(), DispatchError> {
        if sender.protocol_id().is_none() {
            let id = {
                let mut allocator =
                    self.client_ids.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                allocator.allocate()?
            };
            sender.assign_protocol_id(id);
            sender.with_matcher(|matcher| {
                matcher.add_or_update(format!("To: {id}"), 0, false);
            });
            let mut reply = mds_proto::HeaderList::new();
            reply.push(mds_proto::control::ID_ASSIGNMENT, id.to_string())?;
            if let Some(msg_id) = message.control().message_id() {
                reply.push(mds_proto::control::IN_RESPONSE_TO, msg_id)?;
            }
            sender.enqueue_outbound(Message::new(reply));
        }
        Ok(())
    }

    fn handle_intercept(
        &self,
        sender: &Arc<Client>,
        message: &Message,
    ) -> Result<(), DispatchError> {
        let control = message.control();
        let priority = control.priority();
        let modifying = control.modifying();
        let stop = control.stop();
        let patterns = dispatch::intercept_patterns(&message.payload);
        sender.with_matcher(|matcher| {
            for pattern in patterns {
                if stop {
                    matcher.remove(&pattern);
                } else {
                    matcher.add_or_update(pattern, priority, modifying);
                }
            }
        });
        Ok(())
    }

    fn handle_modify_reply(&self, ticket: TicketId, reply: Message) {
        let originator = {
            let mut pending =
                self.rendezvous.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let found = pending.remove(&ticket);
            self.rendezvous_cv.notify_all();
            found
        };
        let Some(conn_id) = originator else { return };
        let Some(originator_client) = self.client(conn_id) else { return };
        originator_client.deposit_reply(reply);
    }

    fn handle_multicast(&self, sender: &Arc<Client>, message: Message) -> Result<(), DispatchError> {
        let ticket = {
            let mut allocator =
                self.tickets.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            allocator.allocate()?
        };

        let mut message = message;
        message.headers.push_front(mds_proto::control::MODIFY_ID, ticket.to_string());

        let matches: Vec<Match> = self
            .snapshot_clients()
            .into_iter()
            .filter(|candidate| candidate.is_open())
            .filter_map(|candidate| {
                candidate
                    .with_matcher(|matcher| matcher.query(&message.headers))
                    .map(|(priority, modifying)| Match {
                        target: candidate.conn_id(),
                        priority,
                        modifying,
                    })
            })
            .collect();

        let targets = sort_matches(matches);
        let originator = sender.protocol_id().unwrap_or(ClientId::ANONYMOUS);
        let multicast = MulticastInProgress::new(ticket, originator, message, targets);
        sender.enqueue_multicast(multicast);
        Ok(())
    }

    /// Advance one target of `sender`'s front-of-queue multicast, if any is
    /// in progress (spec §4.D.3 steps 5-6, §4.D.4).
    ///
    /// Returns `true` if a step was taken (caller should loop again),
    /// `false` if there is currently nothing to advance.
    ///
    /// # Errors
    ///
    /// Propagates a [`DispatchError`] if the rendezvous reply never arrives
    /// and a ticket must be abandoned is not an error case by itself; this
    /// only errors on malformed protocol state.
    pub fn advance_multicast(&self, sender: &Arc<Client>) -> Result<bool, DispatchError> {
        let Some(step) = sender.with_front_multicast(|in_progress| {
            in_progress.targets.pop_front().map(|(target, modifying)| {
                (in_progress.ticket, in_progress.message.clone(), target, modifying)
            })
        }) else {
            return Ok(false);
        };
        let Some((ticket, message, target, modifying)) = step else {
            sender.pop_front_multicast();
            return Ok(true);
        };

        let Some(target_client) = self.client(target) else {
            return Ok(true);
        };
        if !target_client.is_open() {
            return Ok(true);
        }

        if modifying {
            {
                let mut pending =
                    self.rendezvous.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                pending.insert(ticket, target);
            }
            target_client.enqueue_outbound(message);
            if let Some(reply) = target_client.wait_for_reply(std::time::Duration::from_secs(1)) {
                if reply.control().modify() {
                    let consumed = reply.payload.is_empty();
                    sender.with_front_multicast(|in_progress| {
                        if consumed {
                            in_progress.targets.clear();
                        } else {
                            in_progress.message = reply;
                        }
                    });
                }
            }
        } else {
            target_client.enqueue_outbound(strip_modify_id(message));
        }
        Ok(true)
    }

    /// Shrink every client's queue capacity back to its in-use length
    /// (the reserved "danger" signal's response, spec §5; skipped entirely
    /// if the process was started with `--immortal`, per spec §6.3 — that
    /// check is the caller's responsibility).
    pub fn shrink_all_buffers(&self) {
        for client in self.snapshot_clients() {
            client.shrink_buffers();
        }
    }

    /// A one-line summary of router state for the reserved "info" signal
    /// (spec §5): client count, total subscription count across all
    /// clients, and the number of modify replies currently awaited.
    #[must_use]
    pub fn state_summary(&self) -> RouterStateSummary {
        let clients = self.snapshot_clients();
        let subscriptions = clients.iter().map(Client::subscription_count).sum();
        let pending_rendezvous =
            self.rendezvous.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len();
        RouterStateSummary { clients: clients.len(), subscriptions, pending_rendezvous }
    }

    /// Broadcast a synthetic `Client closed` notice for `closed` to every
    /// subscriber of it, consuming `closed`'s own subscriptions in the
    /// process (spec §4.D.1).
    pub fn announce_closed(&self, closed: &Arc<Client>) {
        closed.close();
        let Some(id) = closed.protocol_id() else { return };
        let mut headers = mds_proto::HeaderList::new();
        headers.push(mds_proto::control::CLIENT_CLOSED, id.to_string()).ok();
        let notice = Message::new(headers);
        for candidate in self.snapshot_clients() {
            if !candidate.is_open() || std::ptr::eq(candidate.as_ref(), closed.as_ref()) {
                continue;
            }
            if candidate.with_matcher(|matcher| matcher.query(&notice.headers)).is_some() {
                candidate.enqueue_outbound(notice.clone());
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_round_trips() {
        let router = Router::new();
        let client = router.register(-1);
        assert!(router.client(client.conn_id()).is_some());
        router.deregister(client.conn_id());
        assert!(router.client(client.conn_id()).is_none());
    }

    #[test]
    fn assign_id_gives_first_two_clients_sequential_ids() {
        let router = Router::new();
        let a = router.register(-1);
        let b = router.register(-1);
        let assign = Message::new({
            let mut h = mds_proto::HeaderList::new();
            h.push("Command", "assign-id").unwrap();
            h
        });
        router.dispatch(&a, assign.clone()).unwrap();
        router.dispatch(&b, assign).unwrap();
        assert_eq!(a.protocol_id().unwrap().to_string(), "1:1");
        assert_eq!(b.protocol_id().unwrap().to_string(), "1:2");
    }

    #[test]
    fn intercept_then_multicast_delivers_to_subscriber() {
        let router = Router::new();
        let publisher = router.register(-1);
        let subscriber = router.register(-1);

        let intercept = Message::with_payload(
            {
                let mut h = mds_proto::HeaderList::new();
                h.push("Command", "intercept").unwrap();
                h
            },
            "Command: ping\n",
        );
        router.dispatch(&subscriber, intercept).unwrap();

        let ping = Message::new({
            let mut h = mds_proto::HeaderList::new();
            h.push("Command", "ping").unwrap();
            h
        });
        router.dispatch(&publisher, ping).unwrap();
        while router.advance_multicast(&publisher).unwrap() {}

        let delivered = subscriber.drain_outbound();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].control().command(), Some("ping"));
        assert!(!delivered[0].headers.contains(mds_proto::control::MODIFY_ID));
    }

    #[test]
    fn announce_closed_notifies_subscriber() {
        let router = Router::new();
        let closing = router.register(-1);
        closing.assign_protocol_id(ClientId::from_raw(99));
        let watcher = router.register(-1);
        watcher.with_matcher(|matcher| {
            matcher.add_or_update(mds_proto::control::CLIENT_CLOSED, 0, false);
        });
        router.announce_closed(&closing);
        let delivered = watcher.drain_outbound();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].control().command(), None);
    }
}
