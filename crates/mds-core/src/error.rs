//! Error types for the substrate: marshalling, identifier allocation, and
//! the shared module lifecycle.

use thiserror::Error;

/// Errors produced by the marshalling/unmarshalling substrate (§4.B) and
/// the identifier allocators (§3).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A marshalled envelope's version tag did not match what this binary
    /// produces. Re-exec across incompatible images is not supported.
    #[error("marshal version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// The version this binary writes and expects.
        expected: u32,
        /// The version tag actually read from the stream.
        found: u32,
    },

    /// The marshal stream ended before a value could be fully read.
    #[error("marshal stream truncated while reading {context}")]
    Truncated {
        /// What was being read when the stream ran out.
        context: &'static str,
    },

    /// A remap table lookup referenced an object ID that was never
    /// registered during unmarshal.
    #[error("unresolved remap id {0} during unmarshal")]
    UnresolvedRemap(u64),

    /// The client-ID or modify-ticket counter reached `u64::MAX`.
    ///
    /// Spec §3 marks this a fatal invariant violation rather than a
    /// recoverable error; the caller should abort the process.
    #[error("{counter} counter exhausted u64 range")]
    CounterOverflow {
        /// Which counter overflowed, for the abort log line.
        counter: &'static str,
    },
}
