//! Cast service error types.
//!
//! Every error maps to a stable machine-readable code (`error_code()`) and a
//! client-safe message (`client_message()`). Signaling replies and HTTP
//! responses both use these; internal details are logged server-side only.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Cast service error type.
///
/// HTTP mapping:
/// - `NotFound`: 404
/// - `IncompatibleCapabilities`, `InvalidRequest`: 400
/// - `NotReady`, `AlreadyRunning`, `Cancelled`: 409
/// - `Timeout`: 504
/// - `ProcessError`, `Engine`, `Config`, `Io`, `Internal`: 500
#[derive(Debug, Error)]
pub enum CastError {
    /// Referenced session, transport, producer or consumer is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote's decode capabilities cannot receive the producer's codec.
    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    /// Not enough participants are producing to start compositing.
    #[error("Not ready: {producing} of {required} participants producing")]
    NotReady { required: usize, producing: usize },

    /// A compositing job is already active.
    #[error("Compositing job already running")]
    AlreadyRunning,

    /// A stop request aborted the compositing start.
    #[error("Compositing start cancelled")]
    Cancelled,

    /// The external encoder failed to start or crashed.
    #[error("Encoder process error: {0}")]
    ProcessError(String),

    /// The media engine rejected an operation.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Malformed or semantically invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A request did not complete within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error (descriptor or output directory).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (channel closed, actor gone, ...).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CastError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            CastError::NotFound(_) => "NOT_FOUND",
            CastError::IncompatibleCapabilities(_) => "INCOMPATIBLE_CAPABILITIES",
            CastError::NotReady { .. } => "WAITING_FOR_PEERS",
            CastError::AlreadyRunning => "ALREADY_RUNNING",
            CastError::Cancelled => "CANCELLED",
            CastError::ProcessError(_) => "PROCESS_ERROR",
            CastError::Engine(_) => "ENGINE_ERROR",
            CastError::InvalidRequest(_) => "INVALID_REQUEST",
            CastError::Timeout(_) => "TIMEOUT",
            CastError::Config(_) | CastError::Io(_) | CastError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Error class name used in HTTP bodies (`{"error": ..}`).
    #[must_use]
    pub fn error_name(&self) -> &'static str {
        match self {
            CastError::NotFound(_) => "NotFoundError",
            CastError::IncompatibleCapabilities(_)
            | CastError::InvalidRequest(_)
            | CastError::NotReady { .. }
            | CastError::AlreadyRunning
            | CastError::Cancelled => "BadRequestError",
            CastError::Timeout(_) => "TimeoutError",
            CastError::ProcessError(_)
            | CastError::Engine(_)
            | CastError::Config(_)
            | CastError::Io(_)
            | CastError::Internal(_) => "InternalError",
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            CastError::NotFound(what) => format!("{what} not found"),
            CastError::IncompatibleCapabilities(_) => {
                "Cannot consume this producer with the given capabilities".to_string()
            }
            CastError::NotReady { required, .. } => {
                format!("Waiting for {required} participants to start streaming")
            }
            CastError::AlreadyRunning => "Compositing is already running".to_string(),
            CastError::Cancelled => "Compositing was stopped before it started".to_string(),
            CastError::InvalidRequest(reason) => reason.clone(),
            CastError::Timeout(_) => "Request timed out".to_string(),
            CastError::ProcessError(_)
            | CastError::Engine(_)
            | CastError::Config(_)
            | CastError::Io(_)
            | CastError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            CastError::NotFound(_) => StatusCode::NOT_FOUND,
            CastError::IncompatibleCapabilities(_) | CastError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            CastError::NotReady { .. } | CastError::AlreadyRunning | CastError::Cancelled => {
                StatusCode::CONFLICT
            }
            CastError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CastError::ProcessError(_)
            | CastError::Engine(_)
            | CastError::Config(_)
            | CastError::Io(_)
            | CastError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is a benign race with teardown.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CastError::NotFound(_))
    }
}

impl From<common::error::CommonError> for CastError {
    fn from(err: common::error::CommonError) -> Self {
        CastError::InvalidRequest(err.to_string())
    }
}

/// HTTP error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for CastError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(target: "cast.http", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.error_name(),
            code: self.error_code(),
            message: self.client_message(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_error_codes() {
        assert_eq!(CastError::NotFound("x".into()).error_code(), "NOT_FOUND");
        assert_eq!(
            CastError::NotReady {
                required: 2,
                producing: 1
            }
            .error_code(),
            "WAITING_FOR_PEERS"
        );
        assert_eq!(CastError::AlreadyRunning.error_code(), "ALREADY_RUNNING");
        assert_eq!(
            CastError::Internal("boom".into()).error_code(),
            "INTERNAL_ERROR"
        );
        assert_eq!(CastError::Timeout("x".into()).error_code(), "TIMEOUT");
        assert_eq!(CastError::Cancelled.error_code(), "CANCELLED");
    }

    #[test]
    fn test_client_message_hides_internals() {
        let err = CastError::Engine("worker 1234 pipe broken".into());
        assert!(!err.client_message().contains("1234"));

        let err = CastError::ProcessError("ffmpeg: /tmp/secret.sdp missing".into());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[tokio::test]
    async fn test_not_ready_response_body() {
        let response = CastError::NotReady {
            required: 2,
            producing: 0,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "BadRequestError");
        assert_eq!(body["code"], "WAITING_FOR_PEERS");
        assert!(body["message"].as_str().unwrap().contains('2'));
    }

    #[tokio::test]
    async fn test_cancelled_start_is_a_conflict() {
        let response = CastError::Cancelled.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "CANCELLED");
    }

    #[tokio::test]
    async fn test_internal_response_body() {
        let response = CastError::Internal("actor gone".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "InternalError");
        assert_eq!(body["code"], "INTERNAL_ERROR");
    }
}
