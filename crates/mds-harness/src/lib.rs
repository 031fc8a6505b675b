//! In-process simulation harness for end-to-end router scenarios.
//!
//! Unlike a unit test against [`mds_router::Router`] directly, a
//! [`cluster::SimCluster`] drives the real transport: a Unix-domain socket,
//! the accept loop, and a genuine reader thread per connected client. This
//! is what makes it possible to exercise full round trips (a client
//! actually writes bytes, the router actually reads and dispatches them,
//! replies actually arrive back over the wire) without faking any of the
//! concurrency spec §5 describes.

pub mod client;
pub mod cluster;
pub mod invariants;

pub use client::SimClient;
pub use cluster::SimCluster;
