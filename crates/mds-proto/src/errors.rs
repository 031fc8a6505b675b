//! Error types for frame parsing and composition.

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while parsing or composing wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A header line was not valid UTF-8.
    #[error("header line is not valid UTF-8")]
    HeaderNotUtf8,

    /// A header line was missing the mandatory `': '` delimiter.
    #[error("header line missing ': ' delimiter: {0:?}")]
    MissingDelimiter(String),

    /// A header line was empty before the blank separator line was seen.
    #[error("empty header line")]
    EmptyHeader,

    /// The `Length` header's value was not base-10 digits.
    #[error("invalid Length header value: {0:?}")]
    InvalidLength(String),

    /// A single header value exceeded the 2^15 byte limit.
    #[error("header value exceeds maximum size of {max} bytes (got {size})")]
    HeaderTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size encountered.
        size: usize,
    },

    /// A `Client ID` / `To` header value was not in `high:low` form.
    #[error("invalid client id value: {0:?}")]
    InvalidClientId(String),
}
