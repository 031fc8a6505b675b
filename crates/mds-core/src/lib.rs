//! Shared substrate for the mds router and the modules built against it:
//! the synchronous [`env::Environment`] abstraction, the versioned
//! [`marshal`] format used across re-exec, monotonic [`ids`] allocation,
//! and the shared [`lifecycle`] argument/startup skeleton every module
//! binary uses.

pub mod env;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod marshal;

pub use env::{Environment, SystemEnv};
pub use error::CoreError;
pub use ids::{ClientIdAllocator, TicketId, TicketIdAllocator};
pub use lifecycle::{ModuleArgs, StartMode};
pub use marshal::Marshal;
