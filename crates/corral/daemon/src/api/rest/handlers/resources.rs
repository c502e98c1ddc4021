//! Resource inspection handlers

use crate::api::rest::state::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use corral_broker::UnitRecord;
use corral_types::{Assignment, ResourceKind};
use serde::Deserialize;

/// Unit listing filter
#[derive(Debug, Default, Deserialize)]
pub struct UnitQuery {
    pub kind: Option<ResourceKind>,
    #[serde(default)]
    pub free: bool,
}

/// List resource units and their owners
pub async fn list_units(
    State(state): State<AppState>,
    Query(query): Query<UnitQuery>,
) -> Json<Vec<UnitRecord>> {
    let units = state
        .supervisor
        .broker()
        .units()
        .await
        .into_iter()
        .filter(|r| query.kind.map_or(true, |k| r.unit.kind() == k))
        .filter(|r| !query.free || r.is_free())
        .collect();
    Json(units)
}

/// Assignment listing filter
#[derive(Debug, Default, Deserialize)]
pub struct AssignmentQuery {
    #[serde(default)]
    pub active: bool,
}

/// List assignments, including retained history unless `active=true`
pub async fn list_assignments(
    State(state): State<AppState>,
    Query(query): Query<AssignmentQuery>,
) -> Json<Vec<Assignment>> {
    let assignments = state
        .supervisor
        .broker()
        .assignments()
        .await
        .into_iter()
        .filter(|a| !query.active || a.is_active())
        .collect();
    Json(assignments)
}
