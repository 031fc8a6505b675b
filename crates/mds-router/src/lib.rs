//! The mds message router: the single process every client connects to,
//! and the only component that holds routing state.
//!
//! Unlike [`mds_proto`], which is sans-IO, this crate is not — spec §5
//! calls for genuine blocking reads with a bounded wait on the
//! modify-reply rendezvous, so each connection gets a real OS thread
//! rather than a polled state machine driven by one event loop.

#![warn(missing_docs)]

pub mod client;
pub mod dispatch;
pub mod error;
pub mod matcher;
pub mod multicast;
pub mod reexec;
pub mod router;
pub mod transport;

pub use client::{Client, ConnId, ConnIdAllocator};
pub use dispatch::{DispatchKind, classify};
pub use error::{DispatchError, RouterError};
pub use matcher::{Condition, SubscriptionMatcher};
pub use multicast::MulticastInProgress;
pub use reexec::RouterSnapshot;
pub use router::{Router, RouterStateSummary};
