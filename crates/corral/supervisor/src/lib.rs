//! Corral Supervisor - Client registration and liveness supervision
//!
//! Clients register with their resource requirement, heartbeat while they
//! run, and deregister when they exit. A client that stops heartbeating, or
//! whose process disappears, is declared LOST by the periodic sweep and loses
//! everything it holds, so units never leak to a crashed process.

pub mod error;
pub mod registry;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use registry::RegistrationTable;
pub use supervisor::{ExitSummary, Registered, SweepReport, Supervisor, SupervisorConfig};
