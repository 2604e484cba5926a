//! API error types with HTTP status mapping.

use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::error::{Error, ErrorKind};

/// API error type with HTTP status code mapping.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request - invalid input or malformed body (400).
    BadRequest(String),
    /// Resource not found (404).
    NotFound(String),
    /// Conflict - duplicate resource or operation in flight (409).
    Conflict(String),
    /// Resource is in the wrong state (409).
    PreconditionFailed(String),
    /// Storage pool capacity exceeded (507).
    InsufficientStorage(String),
    /// Hypervisor driver failure (502).
    Driver(String),
    /// Request exceeded the configured timeout (504). The operation may
    /// still complete in the background.
    Timeout(String),
    /// Internal server error (500).
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
}

impl ApiError {
    /// HTTP status and error code for this error.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::PreconditionFailed(_) => (StatusCode::CONFLICT, "PRECONDITION_FAILED"),
            ApiError::InsufficientStorage(_) => {
                (StatusCode::INSUFFICIENT_STORAGE, "INSUFFICIENT_CAPACITY")
            }
            ApiError::Driver(_) => (StatusCode::BAD_GATEWAY, "DRIVER_ERROR"),
            ApiError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Conflict(msg)
            | ApiError::PreconditionFailed(msg)
            | ApiError::InsufficientStorage(msg)
            | ApiError::Driver(msg)
            | ApiError::Timeout(msg)
            | ApiError::Internal(msg) => msg,
        };

        if status.is_server_error() {
            tracing::warn!(status = %status, code, error = %message, "request failed");
        }

        let body = Json(ErrorResponse {
            error: message,
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Validation => ApiError::BadRequest(message),
            ErrorKind::NotFound => ApiError::NotFound(message),
            ErrorKind::Conflict => ApiError::Conflict(message),
            ErrorKind::Precondition => ApiError::PreconditionFailed(message),
            ErrorKind::Capacity => ApiError::InsufficientStorage(message),
            ErrorKind::Driver => ApiError::Driver(message),
            ErrorKind::Internal => ApiError::Internal(message),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("task failed: {}", err))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// JSON body extractor whose rejections use the API error format.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_codes() {
        let cases = [
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (ApiError::PreconditionFailed("x".into()), StatusCode::CONFLICT),
            (
                ApiError::InsufficientStorage("x".into()),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (ApiError::Driver("x".into()), StatusCode::BAD_GATEWAY),
            (ApiError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (
                ApiError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_error_kinds_map_to_api_errors() {
        assert!(matches!(
            ApiError::from(Error::validation("bad")),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(Error::not_found("vm", "vm-1")),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(Error::conflict("busy")),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from(Error::InvalidState {
                expected: "shutoff".into(),
                actual: "running".into()
            }),
            ApiError::PreconditionFailed(_)
        ));
        assert!(matches!(
            ApiError::from(Error::Capacity {
                pool: "p".into(),
                requested_b: 2,
                available_b: 1
            }),
            ApiError::InsufficientStorage(_)
        ));
        assert!(matches!(
            ApiError::from(Error::driver("start", "boom")),
            ApiError::Driver(_)
        ));
        assert!(matches!(
            ApiError::from(Error::database("disk full")),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_precondition_and_conflict_share_status_but_not_code() {
        let (status_a, code_a) = ApiError::Conflict("x".into()).status_and_code();
        let (status_b, code_b) = ApiError::PreconditionFailed("x".into()).status_and_code();
        assert_eq!(status_a, status_b);
        assert_ne!(code_a, code_b);
    }
}
