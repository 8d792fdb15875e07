//! HTTP API routes and handlers.
//!
//! This module contains the local status endpoints:
//! - `health` - Service health checks
//! - `status` - Session state of the running agent
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod error;
pub mod health;
pub mod openapi;
pub mod status;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                - Health check
/// /api
/// ├── /status            - Current session snapshot
/// └── /openapi.json      - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/status", get(status::get_status))
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use keyless_core::{HealthResponse, SessionState, StatusSnapshot};
    use serde_json::Value;
    use tokio::sync::watch;

    use super::*;
    use crate::state::AppState;

    fn server(status: watch::Receiver<StatusSnapshot>) -> TestServer {
        TestServer::new(create_router(AppState::new("A116G61", status))).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_tx, rx) = watch::channel(StatusSnapshot::default());
        let response = server(rx).get("/health").await;

        response.assert_status_ok();
        let body: HealthResponse = response.json();
        assert_eq!(body.status, "ok");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_status_follows_session() {
        let (tx, rx) = watch::channel(StatusSnapshot::default());
        let server = server(rx);

        let body: Value = server.get("/api/status").await.json();
        assert_eq!(body["rcu_id"], "A116G61");
        assert_eq!(body["session"]["state"], "idle");
        assert!(body["session"]["locked"].is_null());

        tx.send_modify(|snapshot| {
            snapshot.state = SessionState::Unlocked;
            snapshot.locked = Some(false);
            snapshot.device_name = Some("Pixel 8".to_string());
        });

        let body: Value = server.get("/api/status").await.json();
        assert_eq!(body["session"]["state"], "unlocked");
        assert_eq!(body["session"]["locked"], false);
        assert_eq!(body["session"]["device_name"], "Pixel 8");
    }

    #[tokio::test]
    async fn test_status_unavailable_after_session_loop_ends() {
        let (tx, rx) = watch::channel(StatusSnapshot::default());
        let server = server(rx);
        drop(tx);

        let response = server.get("/api/status").await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorResponse = response.json();
        assert_eq!(body.error, "session_loop_stopped");
    }

    #[tokio::test]
    async fn test_openapi_document_is_served() {
        let (_tx, rx) = watch::channel(StatusSnapshot::default());
        let body: Value = server(rx).get("/api/openapi.json").await.json();
        assert_eq!(body["info"]["title"], "keyless agent API");
    }
}
