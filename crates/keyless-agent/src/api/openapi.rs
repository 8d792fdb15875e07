//! OpenAPI specification generation for the keyless status API.

use axum::Json;
use keyless_core::{AccessResult, HealthResponse, SessionState, StatusSnapshot};
use utoipa::OpenApi;

use super::error::ErrorResponse;
use super::status::StatusResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for keyless.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "keyless agent API",
        version = "0.1.0",
        description = r#"
# keyless agent API

Local, read-only view of a keyless controller.

The agent unlocks a machine when an authorized phone is near and has answered
a challenge, and locks it again when the phone leaves or the cloud says so.
This API exposes what the agent is doing; it cannot command the lock.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local keyless agent")
    ),
    tags(
        (
            name = "system",
            description = "Health checks and session status"
        )
    ),
    paths(
        super::health::health_check,
        super::status::get_status,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            StatusResponse,
            StatusSnapshot,
            SessionState,
            AccessResult,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "keyless agent API");
        assert!(spec.paths.paths.contains_key("/api/status"));
        assert!(spec.paths.paths.contains_key("/health"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("StatusSnapshot"));
    }
}
