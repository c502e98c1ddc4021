//! Health and status handlers

use crate::api::rest::state::AppState;
use axum::{extract::State, Json};
use corral_types::{RegistrationStatus, ResourceKind};
use serde::Serialize;
use std::collections::BTreeMap;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
    })
}

/// Daemon status response
#[derive(Debug, Serialize)]
pub struct DaemonStatusResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub dry_run: bool,
    pub stats: DaemonStats,
}

/// Daemon statistics
#[derive(Debug, Serialize)]
pub struct DaemonStats {
    pub clients: usize,
    pub degraded_clients: usize,
    pub active_assignments: usize,
    pub units: BTreeMap<ResourceKind, UnitUsage>,
}

/// Owned and total units of one kind
#[derive(Debug, Default, Serialize)]
pub struct UnitUsage {
    pub total: usize,
    pub owned: usize,
}

/// Daemon status endpoint
pub async fn daemon_status(State(state): State<AppState>) -> Json<DaemonStatusResponse> {
    let registrations = state.supervisor.registrations();
    let broker = state.supervisor.broker();

    let degraded = registrations
        .iter()
        .filter(|r| r.status == RegistrationStatus::Degraded)
        .count();
    let active = broker
        .assignments()
        .await
        .iter()
        .filter(|a| a.is_active())
        .count();

    let mut units: BTreeMap<ResourceKind, UnitUsage> = BTreeMap::new();
    for record in broker.units().await {
        let usage = units.entry(record.unit.kind()).or_default();
        usage.total += 1;
        if !record.is_free() {
            usage.owned += 1;
        }
    }

    Json(DaemonStatusResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
        started_at: state.started_at,
        dry_run: state.dry_run,
        stats: DaemonStats {
            clients: registrations.len(),
            degraded_clients: degraded,
            active_assignments: active,
            units,
        },
    })
}
