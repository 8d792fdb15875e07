//! Session status endpoint.

use axum::extract::State;
use axum::Json;
use keyless_core::StatusSnapshot;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Agent status response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusResponse {
    /// Controller id the agent runs as.
    #[schema(example = "A116G61")]
    pub rcu_id: String,

    /// Agent version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Seconds since the agent started.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Latest session snapshot.
    pub session: StatusSnapshot,
}

/// Current session state.
#[utoipa::path(
    get,
    path = "/api/status",
    tag = "system",
    operation_id = "getStatus",
    summary = "Get session status",
    description = "Returns the session state, the last commanded lock state, the device \
        of the current session and the radio fault counters.",
    responses(
        (status = 200, description = "Current status", body = StatusResponse),
        (status = 503, description = "Session loop is not running", body = super::ErrorResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> ApiResult<Json<StatusResponse>> {
    if state.session_stopped() {
        return Err(ApiError::ServiceUnavailable {
            error_code: "session_loop_stopped".to_string(),
            message: "The session loop is not running".to_string(),
            details: None,
        });
    }

    Ok(Json(StatusResponse {
        rcu_id: state.controller_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        session: state.snapshot(),
    }))
}
