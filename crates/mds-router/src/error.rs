//! Router-level error types (spec §7).

use thiserror::Error;

/// Errors surfaced while dispatching a single message.
///
/// Dispatch errors are scoped to the connection that triggered them; per
/// spec §7, "errors inside the router affecting a single client do not
/// affect others."
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A `Length` header (or other numeric control header) did not parse.
    #[error("protocol error: {0}")]
    Protocol(#[from] mds_proto::ProtocolError),

    /// The client-ID or modify-ticket counter overflowed — fatal per §3.
    #[error("{0}")]
    CounterOverflow(#[from] mds_core::CoreError),

    /// An intercept command named a condition whose pattern header was
    /// malformed (e.g. contained an embedded NUL).
    #[error("malformed intercept condition: {0:?}")]
    MalformedCondition(String),
}

/// Top-level router errors (spec §7's logic-invariant and transport
/// categories); these are process-fatal, unlike [`DispatchError`].
#[derive(Error, Debug)]
pub enum RouterError {
    /// The underlying substrate reported a fatal condition (counter
    /// overflow, re-exec unmarshal failure).
    #[error("fatal invariant violation: {0}")]
    Invariant(String),

    /// A socket-level operation failed outside the scope of one client
    /// (e.g. the listening socket itself).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Re-exec state marshalling or unmarshalling failed.
    #[error("re-exec failed: {0}")]
    ReExec(String),
}
