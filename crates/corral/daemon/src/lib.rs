//! Corral Daemon library
//!
//! This module provides the core components for the Corral daemon:
//! - REST client request interface
//! - Layered configuration
//! - Server lifecycle: topology loading, manager isolation, liveness sweep,
//!   event logging and fatal-condition shutdown

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError, DaemonResult};
pub use server::Server;
