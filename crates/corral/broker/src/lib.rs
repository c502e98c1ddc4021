//! Corral Broker - Resource descriptor store and claim broker
//!
//! The [`DescriptorStore`] holds the immutable unit catalog and who owns each
//! unit. The [`ClaimBroker`] is its only writer: it turns requirements into
//! assignments with an optimistic snapshot-then-commit protocol, hands them to
//! the enforcement layer, and rolls them back when enforcement fails.
//!
//! ## Guarantees
//!
//! - A unit is owned by at most one live assignment
//! - A failed claim leaves no unit owned
//! - Release is idempotent; revocation of a process is all-or-nothing

pub mod broker;
pub mod error;
pub mod store;

pub use broker::{AllowAllGate, BrokerConfig, ClaimBroker, ClaimGate, ReleaseOutcome};
pub use error::{BrokerError, BrokerResult};
pub use store::{DescriptorStore, UnitRecord};
