//! Error types for corral-supervisor.

use corral_broker::BrokerError;
use corral_types::{AssignmentId, ProcessId};
use thiserror::Error;

/// Errors that can occur while supervising clients.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No registration exists for the process.
    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),

    /// The process is already registered.
    #[error("process already registered: {0}")]
    AlreadyRegistered(ProcessId),

    /// The assignment belongs to a different process.
    #[error("assignment {assignment_id} is not owned by {process_id}")]
    NotOwner {
        process_id: ProcessId,
        assignment_id: AssignmentId,
    },

    /// Claim, release or revocation failed in the broker.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl SupervisorError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SupervisorError::Broker(e) if e.is_fatal())
    }
}

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;
