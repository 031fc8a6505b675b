//! Message dispatch classification (spec §4.D.2): decide what an inbound
//! message means before the router acts on it. Kept free of locking so it
//! can be unit tested without a running [`crate::router::Router`].

use mds_core::TicketId;
use mds_proto::control::{COMMAND_ASSIGN_ID, COMMAND_INTERCEPT};
use mds_proto::Message;

use crate::error::DispatchError;

/// What a dispatched message asks the router to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchKind {
    /// `Command: assign-id` — allocate an id for the sender if it has
    /// none.
    AssignId,
    /// `Command: intercept` — add, update, or remove subscriptions; never
    /// multicasts.
    Intercept,
    /// A modifying subscriber's reply, identified by `Modifying: yes` plus
    /// a `Modify ID` header naming the rendezvous ticket.
    ModifyReply {
        /// The ticket this reply is answering.
        ticket: TicketId,
    },
    /// Any other message: prepend a fresh `Modify ID` and multicast.
    Multicast,
}

/// Classify an inbound message per spec §4.D.2.
///
/// # Errors
///
/// [`DispatchError::Protocol`] if a `Modify ID` header is present but not
/// valid base-10 digits.
pub fn classify(message: &Message) -> Result<DispatchKind, DispatchError> {
    let control = message.control();
    if control.command() == Some(COMMAND_ASSIGN_ID) {
        return Ok(DispatchKind::AssignId);
    }
    if control.command() == Some(COMMAND_INTERCEPT) {
        return Ok(DispatchKind::Intercept);
    }
    if control.modifying() {
        if let Some(raw) = control.modify_id() {
            let ticket: u64 = raw.parse().map_err(|_| {
                DispatchError::Protocol(mds_proto::ProtocolError::InvalidLength(raw.to_string()))
            })?;
            return Ok(DispatchKind::ModifyReply { ticket: TicketId::from_raw(ticket) });
        }
    }
    Ok(DispatchKind::Multicast)
}

/// Patterns named by an `intercept` command's payload (spec §4.D.2):
/// one pattern per non-empty line, or the catch-all `""` if the payload is
/// empty.
#[must_use]
pub fn intercept_patterns(payload: &[u8]) -> Vec<String> {
    let Ok(text) = std::str::from_utf8(payload) else {
        return vec![String::new()];
    };
    let lines: Vec<String> =
        text.split('\n').filter(|line| !line.is_empty()).map(str::to_string).collect();
    if lines.is_empty() { vec![String::new()] } else { lines }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mds_proto::HeaderList;

    use super::*;

    fn message_with(headers: &[(&str, &str)]) -> Message {
        let mut list = HeaderList::new();
        for (name, value) in headers {
            list.push(*name, *value).unwrap();
        }
        Message::new(list)
    }

    #[test]
    fn assign_id_is_classified() {
        let message = message_with(&[("Command", "assign-id")]);
        assert_eq!(classify(&message).unwrap(), DispatchKind::AssignId);
    }

    #[test]
    fn intercept_is_classified() {
        let message = message_with(&[("Command", "intercept")]);
        assert_eq!(classify(&message).unwrap(), DispatchKind::Intercept);
    }

    #[test]
    fn modify_reply_is_classified_with_ticket() {
        let message = message_with(&[("Modifying", "yes"), ("Modify ID", "7")]);
        assert_eq!(classify(&message).unwrap(), DispatchKind::ModifyReply {
            ticket: TicketId::from_raw(7)
        });
    }

    #[test]
    fn anything_else_is_multicast() {
        let message = message_with(&[("Command", "ping")]);
        assert_eq!(classify(&message).unwrap(), DispatchKind::Multicast);
    }

    #[test]
    fn intercept_patterns_splits_payload_lines() {
        let patterns = intercept_patterns(b"Command: ping\nCommand: pong\n");
        assert_eq!(patterns, vec!["Command: ping", "Command: pong"]);
    }

    #[test]
    fn empty_payload_yields_catch_all() {
        assert_eq!(intercept_patterns(b""), vec![String::new()]);
    }
}
