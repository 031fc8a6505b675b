//! Multicast fanout and the per-target modify rendezvous (spec §4.D.3,
//! §4.D.4).
//!
//! A [`MulticastInProgress`] is queued on its originator and drained by
//! that client's own reader thread (or, equivalently, a delivery thread —
//! the spec permits either as long as the ordering guarantees of §5 hold).
//! Each step here is one target: a plain write for a non-modifying
//! subscriber, or a full rendezvous for a modifying one.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mds_proto::codec::{marshal_message, message_marshal_size, unmarshal_message};
use mds_proto::control::MODIFY_ID;
use mds_proto::{ClientId, Message};

use mds_core::marshal::read_version_tag;
use mds_core::{CoreError, Marshal, TicketId};

use crate::client::ConnId;

/// One in-flight multicast, owned by its originating client.
#[derive(Debug, Clone)]
pub struct MulticastInProgress {
    /// The rendezvous ticket this multicast's `Modify ID` header carries.
    pub ticket: TicketId,
    /// The originating client's protocol id, used only for logging.
    pub originator: ClientId,
    /// The message being fanned out; its payload may be replaced in place
    /// by a modifying subscriber's rewrite.
    pub message: Message,
    /// Remaining `(target, modifying)` pairs, in delivery order.
    pub targets: VecDeque<(ConnId, bool)>,
}

impl MulticastInProgress {
    /// Start a new multicast with the given pre-sorted target list.
    #[must_use]
    pub fn new(
        ticket: TicketId,
        originator: ClientId,
        message: Message,
        targets: Vec<(ConnId, bool)>,
    ) -> Self {
        Self { ticket, originator, message, targets: targets.into() }
    }

    /// True once every target has been processed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.targets.is_empty()
    }
}

impl Marshal for MulticastInProgress {
    const VERSION: u32 = 1;

    fn marshal_size(&self) -> usize {
        4 + 8 + 8 + 4 + message_marshal_size(&self.message) + 4 + self.targets.len() * (8 + 1)
    }

    fn marshal(&self, buffer: &mut BytesMut) {
        buffer.put_u32(Self::VERSION);
        buffer.put_u64(self.ticket.raw());
        buffer.put_u64(self.originator.raw());
        buffer.put_u32(u32::try_from(message_marshal_size(&self.message)).unwrap_or(u32::MAX));
        marshal_message(&self.message, buffer);
        buffer.put_u32(u32::try_from(self.targets.len()).unwrap_or(u32::MAX));
        for (target, modifying) in &self.targets {
            buffer.put_u64(target.raw());
            buffer.put_u8(u8::from(*modifying));
        }
    }

    fn unmarshal(buffer: &mut Bytes) -> mds_core::marshal::Result<Self> {
        read_version_tag(buffer, Self::VERSION)?;
        if buffer.remaining() < 20 {
            return Err(CoreError::Truncated { context: "multicast in progress" });
        }
        let ticket = TicketId::from_raw(buffer.get_u64());
        let originator = ClientId::from_raw(buffer.get_u64());
        let msg_len = buffer.get_u32() as usize;
        if buffer.remaining() < msg_len {
            return Err(CoreError::Truncated { context: "multicast in progress message" });
        }
        let msg_bytes = buffer.split_to(msg_len);
        let message = unmarshal_message(msg_bytes)
            .map_err(|_| CoreError::Truncated { context: "multicast in progress message" })?;
        if buffer.remaining() < 4 {
            return Err(CoreError::Truncated { context: "multicast in progress targets" });
        }
        let target_count = buffer.get_u32() as usize;
        let mut targets = VecDeque::with_capacity(target_count);
        for _ in 0..target_count {
            if buffer.remaining() < 9 {
                return Err(CoreError::Truncated { context: "multicast in progress target" });
            }
            let target = ConnId::from_raw(buffer.get_u64());
            let modifying = buffer.get_u8() != 0;
            targets.push_back((target, modifying));
        }
        Ok(Self { ticket, originator, message, targets })
    }
}

/// A single scanned match, before sorting (spec §4.D.3 step 2).
#[derive(Debug, Clone, Copy)]
pub struct Match {
    /// The matching client's connection id.
    pub target: ConnId,
    /// The priority of the condition that matched.
    pub priority: i64,
    /// Whether the matched condition is modifying.
    pub modifying: bool,
}

/// Sort matches by descending priority; ties break by scan order
/// (`sort_by_key` is stable), which is an acceptable deterministic tiebreak
/// per spec §9's open question on equal-priority ordering.
pub fn sort_matches(mut matches: Vec<Match>) -> Vec<(ConnId, bool)> {
    matches.sort_by_key(|m| std::cmp::Reverse(m.priority));
    matches.into_iter().map(|m| (m.target, m.modifying)).collect()
}

/// Strip the leading `Modify ID:` header before delivering to a
/// non-modifying subscriber (spec §4.D.4's first bullet).
#[must_use]
pub fn strip_modify_id(mut message: Message) -> Message {
    message.headers.remove(MODIFY_ID);
    message
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mds_proto::HeaderList;

    use super::*;
    use crate::client::ConnIdAllocator;

    #[test]
    fn sort_matches_orders_by_descending_priority() {
        let allocator = ConnIdAllocator::default();
        let a = allocator.allocate();
        let b = allocator.allocate();
        let c = allocator.allocate();
        let matches = vec![
            Match { target: a, priority: 0, modifying: false },
            Match { target: b, priority: 10, modifying: true },
            Match { target: c, priority: 5, modifying: false },
        ];
        let sorted = sort_matches(matches);
        assert_eq!(sorted, vec![(b, true), (c, false), (a, false)]);
    }

    #[test]
    fn multicast_in_progress_marshal_round_trips() {
        let allocator = ConnIdAllocator::default();
        let a = allocator.allocate();
        let b = allocator.allocate();

        let mut headers = HeaderList::new();
        headers.push("Command", "ping").unwrap();
        let multicast = MulticastInProgress::new(
            TicketId::from_raw(7),
            ClientId::from_raw(42),
            Message::new(headers),
            vec![(a, true), (b, false)],
        );

        let mut buffer = BytesMut::new();
        multicast.marshal(&mut buffer);
        assert_eq!(buffer.len(), multicast.marshal_size());

        let restored = MulticastInProgress::unmarshal(&mut buffer.freeze()).unwrap();
        assert_eq!(restored.ticket, multicast.ticket);
        assert_eq!(restored.originator, multicast.originator);
        assert_eq!(restored.message.control().command(), Some("ping"));
        assert_eq!(restored.targets, VecDeque::from(vec![(a, true), (b, false)]));
    }

    #[test]
    fn strip_modify_id_removes_only_that_header() {
        let mut headers = HeaderList::new();
        headers.push(MODIFY_ID, "7").unwrap();
        headers.push("Command", "ping").unwrap();
        let message = Message::new(headers);
        let stripped = strip_modify_id(message);
        assert!(!stripped.headers.contains(MODIFY_ID));
        assert!(stripped.headers.contains("Command"));
    }
}
