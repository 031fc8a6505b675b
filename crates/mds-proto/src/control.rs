//! Names and typed accessors for the router-interpreted control headers
//! (spec §6.2). Everything else in a message's header list is opaque to the
//! router and is forwarded verbatim.

use crate::header::{ClientId, HeaderList};

/// Routing verb, e.g. `assign-id`, `intercept`, or an application verb.
pub const COMMAND: &str = "Command";
/// Sender-scoped message identifier, echoed by replies via [`IN_RESPONSE_TO`].
pub const MESSAGE_ID: &str = "Message ID";
/// Sender's assigned client identifier.
pub const CLIENT_ID: &str = "Client ID";
/// Routing hint matched against the self-subscription.
pub const TO: &str = "To";
/// Pairs a reply with the original `Message ID`.
pub const IN_RESPONSE_TO: &str = "In response to";
/// Payload length in bytes; missing means zero.
pub const LENGTH: &str = "Length";
/// Prepended by the router on fanout; a modifying reply must echo it.
pub const MODIFY_ID: &str = "Modify ID";
/// On intercept: may rewrite. On reply: this reply is a rewrite.
pub const MODIFYING: &str = "Modifying";
/// On intercept: remove the condition rather than add it.
pub const STOP: &str = "Stop";
/// Priority for a new or updated subscription.
pub const PRIORITY: &str = "Priority";
/// Synthetic notice emitted by the router when a client disconnects.
pub const CLIENT_CLOSED: &str = "Client closed";
/// In a modification reply: commit the rewrite.
pub const MODIFY: &str = "Modify";
/// Response header carrying a freshly assigned client identifier.
pub const ID_ASSIGNMENT: &str = "ID assignment";

/// The `assign-id` command verb.
pub const COMMAND_ASSIGN_ID: &str = "assign-id";
/// The `intercept` command verb.
pub const COMMAND_INTERCEPT: &str = "intercept";

/// A literal value meaning "yes" for boolean-valued control headers.
pub const YES: &str = "yes";

/// Typed view over a message's control headers, resolved with
/// last-occurrence-wins semantics.
#[derive(Debug, Clone, Copy)]
pub struct ControlHeaders<'a> {
    headers: &'a HeaderList,
}

impl<'a> ControlHeaders<'a> {
    /// Wrap a header list for control-header inspection.
    #[must_use]
    pub fn new(headers: &'a HeaderList) -> Self {
        Self { headers }
    }

    /// The `Command:` value, if present.
    #[must_use]
    pub fn command(&self) -> Option<&'a str> {
        self.headers.get_last(COMMAND)
    }

    /// The `Message ID:` value, if present.
    #[must_use]
    pub fn message_id(&self) -> Option<&'a str> {
        self.headers.get_last(MESSAGE_ID)
    }

    /// The `Client ID:` value, parsed.
    #[must_use]
    pub fn client_id(&self) -> Option<ClientId> {
        self.headers.get_last(CLIENT_ID).and_then(|v| ClientId::parse(v).ok())
    }

    /// The `To:` value, parsed.
    #[must_use]
    pub fn to(&self) -> Option<ClientId> {
        self.headers.get_last(TO).and_then(|v| ClientId::parse(v).ok())
    }

    /// The `In response to:` value, if present.
    #[must_use]
    pub fn in_response_to(&self) -> Option<&'a str> {
        self.headers.get_last(IN_RESPONSE_TO)
    }

    /// The declared payload length, defaulting to zero when absent.
    ///
    /// # Errors
    ///
    /// [`crate::errors::ProtocolError::InvalidLength`] if present but not
    /// base-10 digits.
    pub fn length(&self) -> crate::errors::Result<usize> {
        match self.headers.get_last(LENGTH) {
            None => Ok(0),
            Some(v) if !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()) => v
                .parse()
                .map_err(|_| crate::errors::ProtocolError::InvalidLength(v.to_string())),
            Some(v) => Err(crate::errors::ProtocolError::InvalidLength(v.to_string())),
        }
    }

    /// The `Modify ID:` value, if present.
    #[must_use]
    pub fn modify_id(&self) -> Option<&'a str> {
        self.headers.get_last(MODIFY_ID)
    }

    /// True if `Modifying: yes` is present.
    #[must_use]
    pub fn modifying(&self) -> bool {
        self.headers.get_last(MODIFYING) == Some(YES)
    }

    /// True if `Stop: yes` is present.
    #[must_use]
    pub fn stop(&self) -> bool {
        self.headers.get_last(STOP) == Some(YES)
    }

    /// The `Priority:` value, parsed, defaulting to zero when absent.
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.headers.get_last(PRIORITY).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// True if `Modify: yes` is present (a committed rewrite/consume reply).
    #[must_use]
    pub fn modify(&self) -> bool {
        self.headers.get_last(MODIFY) == Some(YES)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reads_assign_id_command() {
        let mut headers = HeaderList::new();
        headers.push(COMMAND, COMMAND_ASSIGN_ID).unwrap();
        headers.push(MESSAGE_ID, "7").unwrap();
        let ctl = ControlHeaders::new(&headers);
        assert_eq!(ctl.command(), Some(COMMAND_ASSIGN_ID));
        assert_eq!(ctl.message_id(), Some("7"));
    }

    #[test]
    fn missing_length_defaults_to_zero() {
        let headers = HeaderList::new();
        assert_eq!(ControlHeaders::new(&headers).length().unwrap(), 0);
    }

    #[test]
    fn missing_priority_defaults_to_zero() {
        let headers = HeaderList::new();
        assert_eq!(ControlHeaders::new(&headers).priority(), 0);
    }

    #[test]
    fn length_with_leading_plus_is_rejected() {
        let mut headers = HeaderList::new();
        headers.push(LENGTH, "+5").unwrap();
        assert!(ControlHeaders::new(&headers).length().is_err());
    }

    #[test]
    fn length_with_non_digit_is_rejected() {
        let mut headers = HeaderList::new();
        headers.push(LENGTH, "12x").unwrap();
        assert!(ControlHeaders::new(&headers).length().is_err());
    }
}
