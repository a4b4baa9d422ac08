//! Mapping of extension errors onto HTTP responses

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uros_core::Error;

/// Error body returned by every failing endpoint
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    field: Option<&'static str>,
}

impl ApiError {
    /// Malformed request the extension never got to interpret
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
            field: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            e if e.is_conflict() => StatusCode::CONFLICT,
            Error::Crashed(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let field = match &err {
            Error::Validation(v) => Some(v.field),
            _ => None,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
            field,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{}: {}", self.kind, self.message);
        }
        let body = json!({
            "success": false,
            "error": self.kind,
            "message": self.message,
            "field": self.field,
        });
        (self.status, Json(body)).into_response()
    }
}
