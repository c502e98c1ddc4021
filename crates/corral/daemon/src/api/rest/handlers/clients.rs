//! Client request handlers: register, heartbeat, claim, release, deregister

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use corral_broker::ReleaseOutcome;
use corral_supervisor::{ExitSummary, Registered};
use corral_types::{Assignment, AssignmentId, ClientRegistration, ProcessId, ResourceRequirement};
use serde::{Deserialize, Serialize};

/// Register client request
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub pid: u32,
    pub requirement: ResourceRequirement,
}

/// Claim request
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub requirement: ResourceRequirement,
}

/// Release response
#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub assignment_id: AssignmentId,
    pub outcome: ReleaseOutcome,
}

/// A client with its live assignments
#[derive(Debug, Serialize)]
pub struct ClientDetail {
    pub registration: ClientRegistration,
    pub assignments: Vec<Assignment>,
}

/// Register a process and claim its declared requirement
pub async fn register_client(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Registered>)> {
    let registered = state
        .supervisor
        .register(ProcessId::new(request.pid), request.requirement)
        .await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

/// Record a heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> ApiResult<Json<ClientRegistration>> {
    let registration = state.supervisor.heartbeat(ProcessId::new(pid))?;
    Ok(Json(registration))
}

/// Claim additional units for a registered process
pub async fn claim(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult<(StatusCode, Json<Assignment>)> {
    let assignment = state
        .supervisor
        .claim(ProcessId::new(pid), &request.requirement)
        .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

/// Release one assignment
pub async fn release(
    State(state): State<AppState>,
    Path((pid, id)): Path<(u32, String)>,
) -> ApiResult<Json<ReleaseResponse>> {
    let assignment_id: AssignmentId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid assignment id {}: {}", id, e)))?;

    let outcome = state
        .supervisor
        .release(ProcessId::new(pid), assignment_id)
        .await?;

    Ok(Json(ReleaseResponse {
        assignment_id,
        outcome,
    }))
}

/// Deregister a process, revoking everything it holds
pub async fn deregister(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> ApiResult<Json<ExitSummary>> {
    let summary = state.supervisor.deregister(ProcessId::new(pid)).await?;
    Ok(Json(summary))
}

/// List registered clients
pub async fn list_clients(State(state): State<AppState>) -> Json<Vec<ClientRegistration>> {
    Json(state.supervisor.registrations())
}

/// Get one client and its live assignments
pub async fn get_client(
    State(state): State<AppState>,
    Path(pid): Path<u32>,
) -> ApiResult<Json<ClientDetail>> {
    let pid = ProcessId::new(pid);
    let registration = state
        .supervisor
        .registration(pid)
        .ok_or(ApiError::UnknownProcess(pid))?;
    let assignments = state.supervisor.broker().assignments_for(pid).await;

    Ok(Json(ClientDetail {
        registration,
        assignments,
    }))
}
