//! Error types for corral-daemon

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use corral_broker::BrokerError;
use corral_enforce::IsolationError;
use corral_supervisor::SupervisorError;
use corral_types::{AssignmentId, ProcessId, ResourceKind, TopologyError};
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host topology could not be loaded
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Manager isolation failed at startup
    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    /// Manager lacks the privilege needed for enforcement
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The manager can no longer uphold its invariants
    #[error("Fatal condition: {0}")]
    Fatal(String),
}

impl DaemonError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DaemonError::Fatal(_) => 2,
            _ => 1,
        }
    }
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Process is not registered
    #[error("Unknown process: {0}")]
    UnknownProcess(ProcessId),

    /// Process is already registered
    #[error("Process already registered: {0}")]
    AlreadyRegistered(ProcessId),

    /// Assignment belongs to another process
    #[error("Assignment {assignment_id} is not owned by {process_id}")]
    NotOwner {
        process_id: ProcessId,
        assignment_id: AssignmentId,
    },

    /// Not enough free units
    #[error("Insufficient {kind} units: requested {requested}, available {available}")]
    InsufficientResources {
        kind: ResourceKind,
        requested: u32,
        available: u32,
    },

    /// Requirement is malformed
    #[error("Invalid requirement: {0}")]
    InvalidRequirement(String),

    /// Host directives could not be applied
    #[error("Enforcement failed: {0}")]
    EnforcementFailed(String),

    /// Claim was cancelled by deregistration
    #[error("Claim cancelled: {0}")]
    Cancelled(ProcessId),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InsufficientResources {
                kind,
                requested,
                available,
            } => ApiError::InsufficientResources {
                kind,
                requested,
                available,
            },
            BrokerError::InvalidRequirement(e) => ApiError::InvalidRequirement(e.to_string()),
            BrokerError::Enforcement(e) => ApiError::EnforcementFailed(e.to_string()),
            BrokerError::Cancelled(pid) => ApiError::Cancelled(pid),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::UnknownProcess(pid) => ApiError::UnknownProcess(pid),
            SupervisorError::AlreadyRegistered(pid) => ApiError::AlreadyRegistered(pid),
            SupervisorError::NotOwner {
                process_id,
                assignment_id,
            } => ApiError::NotOwner {
                process_id,
                assignment_id,
            },
            SupervisorError::Broker(e) => e.into(),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::UnknownProcess(_) => (StatusCode::NOT_FOUND, "UNKNOWN_PROCESS"),
            ApiError::AlreadyRegistered(_) => (StatusCode::CONFLICT, "ALREADY_REGISTERED"),
            ApiError::NotOwner { .. } => (StatusCode::FORBIDDEN, "NOT_OWNER"),
            ApiError::InsufficientResources { .. } => {
                (StatusCode::CONFLICT, "INSUFFICIENT_RESOURCES")
            }
            ApiError::InvalidRequirement(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUIREMENT"),
            ApiError::EnforcementFailed(_) => (StatusCode::BAD_GATEWAY, "ENFORCEMENT_FAILED"),
            ApiError::Cancelled(_) => (StatusCode::CONFLICT, "CLAIM_CANCELLED"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let details = match &self {
            ApiError::InsufficientResources {
                kind,
                requested,
                available,
            } => Some(serde_json::json!({
                "kind": kind,
                "requested": requested,
                "available": available,
            })),
            _ => None,
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
