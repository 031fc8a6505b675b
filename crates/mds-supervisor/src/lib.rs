//! The per-display supervisor (spec §4.E): resolves a free display index,
//! prepares the runtime and storage directories, owns the listening
//! socket, and spawns and respawns the router image across its lifetime.
//!
//! This binary is the only part of the system allowed to run with
//! elevated privileges, and only for the brief window between creating
//! the runtime directories/socket and dropping to the real uid/gid.

#![warn(missing_docs)]

pub mod bootstrap;
pub mod privilege;
pub mod spawn;

pub use bootstrap::{BootstrapError, DisplayPaths, resolve_display};
pub use spawn::{
    DEFAULT_MIN_LIFETIME, RespawnDecision, SpawnError, StartFlag, clear_cloexec, spawn_router,
    wait_and_decide,
};
