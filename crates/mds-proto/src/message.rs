//! The in-memory message type: a header list plus an opaque payload.

use bytes::Bytes;

use crate::header::HeaderList;

/// A fully parsed message: headers in wire order, plus the exact-length
/// payload bytes declared by the `Length` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header lines, in the order they appeared on the wire.
    pub headers: HeaderList,
    /// The payload, exactly as long as the `Length` header declared.
    pub payload: Bytes,
}

impl Message {
    /// Construct a message with no payload.
    #[must_use]
    pub fn new(headers: HeaderList) -> Self {
        Self { headers, payload: Bytes::new() }
    }

    /// Construct a message with headers and a payload.
    #[must_use]
    pub fn with_payload(headers: HeaderList, payload: impl Into<Bytes>) -> Self {
        Self { headers, payload: payload.into() }
    }

    /// Resolved control-header view over this message.
    #[must_use]
    pub fn control(&self) -> crate::control::ControlHeaders<'_> {
        crate::control::ControlHeaders::new(&self.headers)
    }
}
