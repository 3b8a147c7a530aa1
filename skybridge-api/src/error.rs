///! Standardized error handling for API responses
///!
///! Maps the shared error taxonomy onto consistent JSON error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Standard API error response format: `{"error": ..., "details": ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,

    /// Optional detailed error information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// API error types with standardized responses
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request
    BadRequest(String),

    /// 404 Not Found
    NotFound(String),

    /// 409 Conflict
    Conflict(String),

    /// 429 Too Many Requests
    ResourceExhausted(String),

    /// 400 with explanatory details about missing prerequisites
    PreconditionFailed(String),

    /// 503 Service Unavailable
    RemoteUnavailable(String),

    /// 500 Internal Server Error
    Internal(String),
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, ErrorResponse) {
        match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, ErrorResponse::new(msg.clone()))
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new(msg.clone())),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new(msg.clone())),
            ApiError::ResourceExhausted(msg) => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse::new(msg.clone()),
            ),
            ApiError::PreconditionFailed(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("precondition failed").with_details(msg.clone()),
            ),
            ApiError::RemoteUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorResponse::new(msg.clone()),
            ),
            ApiError::Internal(msg) => {
                error!("Internal API error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("An internal server error occurred")
                        .with_details(msg.clone()),
                )
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}

impl From<skybridge_common::Error> for ApiError {
    fn from(err: skybridge_common::Error) -> Self {
        use skybridge_common::Error;
        match err {
            Error::InvalidRequest(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::ResourceExhausted(msg) => ApiError::ResourceExhausted(msg),
            Error::PreconditionFailed(msg) => ApiError::PreconditionFailed(msg),
            Error::RemoteUnavailable(msg) => ApiError::RemoteUnavailable(msg),
            Error::Cancelled(msg) => ApiError::Conflict(format!("operation cancelled: {}", msg)),
            Error::System(msg) => ApiError::Internal(msg),
            Error::Io(e) => ApiError::Internal(format!("I/O error: {}", e)),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        error!("Database error: {}", err);
        ApiError::Internal("Database error occurred".to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("Invalid JSON: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shape() {
        let body = ErrorResponse::new("no previous backup found");
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":"no previous backup found"}"#);

        let body = ErrorResponse::new("precondition failed").with_details("template missing");
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"details\":\"template missing\""));
    }

    #[test]
    fn test_taxonomy_mapping() {
        let err: ApiError = skybridge_common::Error::ResourceExhausted("no free ports".into()).into();
        let (status, body) = err.status_and_body();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.error, "no free ports");

        let err: ApiError = skybridge_common::Error::NotFound("vm 'pgtest1'".into()).into();
        let (status, _) = err.status_and_body();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let err: ApiError = skybridge_common::Error::RemoteUnavailable("node timeout".into()).into();
        let (status, _) = err.status_and_body();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let err: ApiError =
            skybridge_common::Error::PreconditionFailed("service offering missing".into()).into();
        let (status, body) = err.status_and_body();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.details.as_deref(), Some("service offering missing"));
    }
}
