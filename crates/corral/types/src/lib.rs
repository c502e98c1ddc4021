//! Corral Types - Core types for host resource isolation
//!
//! Corral is the resource manager for a small, fixed set of co-located
//! latency-sensitive processes (a market-data subscriber and handler) on a
//! single host. It hands out CPU cores, real-time priority slots and
//! locked-memory blocks, enforces them on the host, and takes them back when
//! a client leaves or stops heartbeating.
//!
//! ## Key Concepts
//!
//! - **ResourceUnit**: one indivisible allocatable item (core, priority slot,
//!   memory-lock block), built once from the [`HostTopology`]
//! - **Assignment**: units bound to one client process, with a checked
//!   PENDING → ACTIVE → RELEASED | REVOKED lifecycle
//! - **ClientRegistration**: a supervised process and its liveness
//! - **Events**: unified observability stream

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod assignment;
pub mod error;
pub mod events;
pub mod ids;
pub mod registration;
pub mod requirement;
pub mod resource;
pub mod topology;

pub use assignment::{Assignment, AssignmentStatus};
pub use error::{RequirementError, TopologyError, TransitionError};
pub use events::{CorralEvent, CorralEventEnvelope, EventSeverity, EventSource, ExitKind};
pub use ids::{AssignmentId, ProcessId};
pub use registration::{ClientRegistration, RegistrationStatus};
pub use requirement::{RequirementItem, ResourceRequirement};
pub use resource::{ResourceKind, ResourceUnit, UnitConstraint, UnitDetail, UnitId};
pub use topology::{
    HostTopology, HugepageSize, HugepagesSpec, MemoryLockSpec, PriorityBandSpec,
    MAX_RT_PRIORITY, MIN_RT_PRIORITY,
};
