//! Error types for corral-enforce.

use corral_types::ProcessId;
use thiserror::Error;

/// Failure reported by a host-control primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    /// Target process does not exist (ESRCH).
    #[error("no such process")]
    NoSuchProcess,

    /// Caller lacks the privilege for this directive (EPERM).
    #[error("permission denied")]
    PermissionDenied,

    /// Directive not available on this platform.
    #[error("unsupported on this platform")]
    Unsupported,

    /// Any other host failure.
    #[error("{0}")]
    Other(String),
}

/// Errors raised while applying or reverting host directives.
#[derive(Debug, Clone, Error)]
pub enum EnforcementError {
    /// Host call did not complete in time.
    #[error("{op} for {process_id} timed out after {timeout_ms}ms")]
    Timeout {
        process_id: ProcessId,
        op: &'static str,
        timeout_ms: u64,
    },

    /// Host state read back after applying does not match intent.
    #[error("{what} mismatch for {process_id}: expected {expected}, found {actual}")]
    Mismatch {
        process_id: ProcessId,
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// Target process has exited.
    #[error("process {0} no longer exists")]
    ProcessGone(ProcessId),

    /// Manager lacks the privilege required for enforcement.
    #[error("{op} for {process_id} denied: manager lacks privilege")]
    PrivilegeLost {
        process_id: ProcessId,
        op: &'static str,
    },

    /// Host call failed for another reason.
    #[error("{op} for {process_id} failed: {reason}")]
    Host {
        process_id: ProcessId,
        op: &'static str,
        reason: String,
    },
}

impl EnforcementError {
    pub(crate) fn from_host(process_id: ProcessId, op: &'static str, err: HostError) -> Self {
        match err {
            HostError::NoSuchProcess => EnforcementError::ProcessGone(process_id),
            HostError::PermissionDenied => EnforcementError::PrivilegeLost { process_id, op },
            HostError::Unsupported => EnforcementError::Host {
                process_id,
                op,
                reason: "unsupported on this platform".to_string(),
            },
            HostError::Other(reason) => EnforcementError::Host {
                process_id,
                op,
                reason,
            },
        }
    }

    /// Whether this failure means the manager can no longer enforce anything.
    pub fn is_privilege_loss(&self) -> bool {
        matches!(self, EnforcementError::PrivilegeLost { .. })
    }

    pub fn is_process_gone(&self) -> bool {
        matches!(self, EnforcementError::ProcessGone(_))
    }
}

/// Errors raised while isolating the manager process itself at startup.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("failed to pin manager to core {core}: {source}")]
    Pin {
        core: u32,
        #[source]
        source: HostError,
    },

    #[error("failed to reserve hugepages via {path}: {source}")]
    Hugepages {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("hugepage reservation short: requested {requested}, kernel granted {granted}")]
    HugepagesShort { requested: u32, granted: u32 },

    #[error("invalid hugepage configuration: {0}")]
    Config(#[from] corral_types::TopologyError),
}

/// Result type for enforcement operations.
pub type EnforcementResult<T> = Result<T, EnforcementError>;
