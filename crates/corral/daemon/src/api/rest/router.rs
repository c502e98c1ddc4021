//! API Router configuration

use super::handlers;
use super::state::AppState;
use crate::config::ServerConfig;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let api_routes = Router::new()
        // Health and status
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::daemon_status))
        // Clients
        .route("/clients", get(handlers::list_clients))
        .route("/clients", post(handlers::register_client))
        .route("/clients/:pid", get(handlers::get_client))
        .route("/clients/:pid", delete(handlers::deregister))
        .route("/clients/:pid/heartbeat", post(handlers::heartbeat))
        .route("/clients/:pid/claims", post(handlers::claim))
        .route("/clients/:pid/assignments/:id", delete(handlers::release))
        // Resources
        .route("/units", get(handlers::list_units))
        .route("/assignments", get(handlers::list_assignments));

    let router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs,
        )))
        .layer(TraceLayer::new_for_http());

    let router = if server.enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use corral_broker::{BrokerConfig, DescriptorStore};
    use corral_enforce::{EnforcementConfig, EnforcementEngine, RecordingHostControl};
    use corral_supervisor::{Supervisor, SupervisorConfig};
    use corral_types::HostTopology;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    const TOPOLOGY: &str = r#"
cpus: [0, 1, 2, 3]
priority_bands:
  - name: HIGH
    priority: 80
    capacity: 1
memory_lock:
  block_mb: 64
  blocks: 1
"#;

    fn test_app() -> Router {
        let topology = HostTopology::from_yaml_str(TOPOLOGY).unwrap();
        let store = Arc::new(DescriptorStore::initialize(&topology).unwrap());
        let host = Arc::new(RecordingHostControl::permissive(0..8));
        let engine = Arc::new(EnforcementEngine::new(
            host.clone(),
            EnforcementConfig::default(),
        ));
        let supervisor = Supervisor::assemble(
            SupervisorConfig::default(),
            BrokerConfig::default(),
            store,
            engine,
            host,
        );

        create_router(
            AppState::new(Arc::new(supervisor), true),
            &ServerConfig::default(),
        )
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn cpus(count: u32) -> Value {
        json!({ "items": [{ "kind": "CPU", "count": count }] })
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/v1/health", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_register_and_inspect_client() {
        let app = test_app();
        let requirement = json!({
            "items": [
                { "kind": "CPU", "count": 2 },
                { "kind": "PRIORITY", "count": 1,
                  "constraints": [{ "type": "band", "name": "HIGH" }] }
            ]
        });

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 100, "requirement": requirement })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["assignment"]["status"], "ACTIVE");
        assert_eq!(body["assignment"]["units"].as_array().unwrap().len(), 3);

        let (status, body) = send(&app, "GET", "/api/v1/clients/100", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["registration"]["status"], "REGISTERED");
        assert_eq!(body["assignments"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "POST", "/api/v1/clients/100/heartbeat", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["process_id"], 100);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let app = test_app();
        let register = json!({ "pid": 7, "requirement": cpus(1) });

        let (status, _) = send(&app, "POST", "/api/v1/clients", Some(register.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, "POST", "/api/v1/clients", Some(register)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "ALREADY_REGISTERED");
    }

    #[tokio::test]
    async fn test_over_claim_then_retry_after_deregistration() {
        let app = test_app();

        for pid in [1, 2] {
            let (status, _) = send(
                &app,
                "POST",
                "/api/v1/clients",
                Some(json!({ "pid": pid, "requirement": cpus(2) })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 3, "requirement": cpus(1) })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INSUFFICIENT_RESOURCES");
        assert_eq!(body["details"]["requested"], 1);
        assert_eq!(body["details"]["available"], 0);

        let (status, body) = send(&app, "DELETE", "/api/v1/clients/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"].as_array().unwrap().len(), 1);

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 3, "requirement": cpus(1) })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let app = test_app();
        send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 10, "requirement": cpus(1) })),
        )
        .await;

        let (status, assignment) = send(
            &app,
            "POST",
            "/api/v1/clients/10/claims",
            Some(json!({ "requirement": cpus(1) })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = assignment["id"].as_str().unwrap().to_string();

        let uri = format!("/api/v1/clients/10/assignments/{}", id);
        let (status, body) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "released");

        let (status, body) = send(&app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_finished");

        let (_, units) = send(&app, "GET", "/api/v1/units?kind=CPU&free=true", None).await;
        assert_eq!(units.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_release_rejects_foreign_and_malformed_ids() {
        let app = test_app();
        let (_, registered) = send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 20, "requirement": cpus(1) })),
        )
        .await;
        send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 21, "requirement": cpus(1) })),
        )
        .await;

        let id = registered["assignment"]["id"].as_str().unwrap();
        let (status, body) = send(
            &app,
            "DELETE",
            &format!("/api/v1/clients/21/assignments/{}", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "NOT_OWNER");

        let (status, body) = send(
            &app,
            "DELETE",
            "/api/v1/clients/20/assignments/not-a-uuid",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_unknown_process() {
        let app = test_app();

        let (status, body) = send(&app, "POST", "/api/v1/clients/999/heartbeat", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_PROCESS");

        let (status, _) = send(&app, "GET", "/api/v1/clients/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "DELETE", "/api/v1/clients/999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_requirement() {
        let app = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 5, "requirement": { "items": [] } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUIREMENT");
    }

    #[tokio::test]
    async fn test_status_reports_usage() {
        let app = test_app();
        send(
            &app,
            "POST",
            "/api/v1/clients",
            Some(json!({ "pid": 30, "requirement": cpus(2) })),
        )
        .await;

        let (status, body) = send(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dry_run"], true);
        assert_eq!(body["stats"]["clients"], 1);
        assert_eq!(body["stats"]["active_assignments"], 1);
        assert_eq!(body["stats"]["units"]["CPU"]["total"], 4);
        assert_eq!(body["stats"]["units"]["CPU"]["owned"], 2);
        assert_eq!(body["stats"]["units"]["MEMORY_LOCK"]["owned"], 0);

        let (_, assignments) = send(&app, "GET", "/api/v1/assignments?active=true", None).await;
        assert_eq!(assignments.as_array().unwrap().len(), 1);
    }
}
