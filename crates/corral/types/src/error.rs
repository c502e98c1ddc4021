//! Error types shared across Corral crates

use crate::assignment::AssignmentStatus;
use crate::ids::AssignmentId;
use crate::resource::ResourceKind;
use thiserror::Error;

/// Malformed host topology. Always startup-fatal.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read topology file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse topology: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("topology describes no allocatable resources")]
    Empty,

    #[error("duplicate resource unit: {0}")]
    DuplicateUnit(String),

    #[error("duplicate priority band: {0}")]
    DuplicateBand(String),

    #[error("priority band '{band}' has out-of-range priority {priority} (expected 1..=99)")]
    InvalidPriority { band: String, priority: i32 },

    #[error("manager core {0} is also listed as allocatable")]
    ManagerCoreAllocatable(u32),

    #[error("invalid topology: {0}")]
    Invalid(String),
}

/// A requirement that can never be satisfied as written
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequirementError {
    #[error("requirement requests no units")]
    Empty,

    #[error("constraint {constraint} does not apply to {kind} units")]
    ConstraintKindMismatch {
        kind: ResourceKind,
        constraint: String,
    },
}

/// Attempted an edge the assignment state machine does not allow
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid transition for {assignment_id}: {from} -> {to}")]
pub struct TransitionError {
    pub assignment_id: AssignmentId,
    pub from: AssignmentStatus,
    pub to: AssignmentStatus,
}
