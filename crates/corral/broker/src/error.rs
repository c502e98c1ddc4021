//! Error types for corral-broker.

use corral_enforce::EnforcementError;
use corral_types::{ProcessId, RequirementError, ResourceKind, TransitionError, UnitId};
use thiserror::Error;

/// Errors that can occur while claiming, releasing or revoking units.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Fewer matching free units exist than requested. Nothing was committed.
    #[error("insufficient {kind} units: requested {requested}, available {available}")]
    InsufficientResources {
        kind: ResourceKind,
        requested: u32,
        available: u32,
    },

    /// A selected unit changed between snapshot and commit.
    #[error("unit {unit} changed since snapshot")]
    Conflict { unit: UnitId },

    /// Requirement is malformed.
    #[error("invalid requirement: {0}")]
    InvalidRequirement(#[from] RequirementError),

    /// Host directives could not be applied; the assignment was rolled back.
    #[error("enforcement failed: {0}")]
    Enforcement(#[from] EnforcementError),

    /// The process stopped accepting claims while this claim was in flight.
    #[error("claim for {0} cancelled: process is not accepting claims")]
    Cancelled(ProcessId),

    /// Store and assignment table disagree.
    #[error("internal state corrupted: {0}")]
    StateCorrupted(String),

    /// Illegal assignment state transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl BrokerError {
    /// Whether the manager cannot safely keep running after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            BrokerError::StateCorrupted(_) | BrokerError::Transition(_) => true,
            BrokerError::Enforcement(e) => e.is_privilege_loss(),
            _ => false,
        }
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
