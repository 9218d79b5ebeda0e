//! AegisError → HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use aegis_shared::errors::{AegisError, ErrorKind};

/// Wrapper so handlers can `?` straight into an HTTP response.
pub struct ApiError(pub AegisError);

impl From<AegisError> for ApiError {
    fn from(e: AegisError) -> Self {
        ApiError(e)
    }
}

/// Stable kind tag clients can switch on.
fn kind_tag(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::Conflict => "state_conflict",
        ErrorKind::NotFound => "not_found",
        ErrorKind::ResourceExhausted => "resource_exhausted",
        ErrorKind::Backend => "backend",
        ErrorKind::Io => "io",
        ErrorKind::Fatal => "fatal",
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        ErrorKind::Backend | ErrorKind::Io | ErrorKind::Fatal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let body = json!({
            "error": {
                "kind": kind_tag(kind),
                "message": self.0.to_string(),
            }
        });
        (status_for(kind), Json(body)).into_response()
    }
}
