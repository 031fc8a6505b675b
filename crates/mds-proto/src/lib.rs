//! Wire protocol for the mds router: the framed text-header message format
//! of §3/§6.1, its incremental codec, and the control headers the router
//! itself interprets.
//!
//! This crate is sans-IO: [`Codec`] consumes bytes handed to it and
//! produces [`Message`] values; nothing here touches a socket.

pub mod codec;
pub mod control;
pub mod errors;
pub mod header;
pub mod message;

pub use codec::{Codec, ReadOutcome};
pub use control::ControlHeaders;
pub use errors::{ProtocolError, Result};
pub use header::{ClientId, HeaderList};
pub use message::Message;
