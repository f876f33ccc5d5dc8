//! API error types.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use detgate_inference::InferenceError;
use detgate_models::ErrorKind;
use detgate_storage::StagingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Staging failed: {0}")]
    Staging(#[from] StagingError),

    #[error("Detection failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::InvalidInput(_) => ErrorKind::InvalidInput,
            ApiError::Unauthorized(_) => ErrorKind::Unauthorized,
            ApiError::RateLimited => ErrorKind::RateLimited,
            ApiError::Staging(_) => ErrorKind::StagingError,
            ApiError::Inference(e) => e.kind(),
            ApiError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a streaming session must close after this error.
    ///
    /// Failures tied to one frame leave the session usable; failures of the
    /// gateway itself do not.
    pub fn is_fatal_for_stream(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StagingError | ErrorKind::LaunchFailed | ErrorKind::Internal
        )
    }

    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Client-facing error body. Carries only the generic message for the kind.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub kind: ErrorKind,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();

        if status.is_server_error() {
            error!(kind = %kind, "Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: kind.public_message(),
            kind,
        };

        let mut response = (status, Json(body)).into_response();
        if kind == ErrorKind::RateLimited {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::invalid_input("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::unauthorized("x").status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let worker = ApiError::from(InferenceError::WorkerFailed {
            status: Some(1),
            stderr: "model load failed".to_string(),
        });
        assert_eq!(worker.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(worker.kind(), ErrorKind::WorkerFailed);
    }

    #[test]
    fn test_stream_fatality() {
        assert!(ApiError::from(InferenceError::launch_failed("missing")).is_fatal_for_stream());
        assert!(!ApiError::from(InferenceError::Timeout(Duration::from_secs(1))).is_fatal_for_stream());
        assert!(!ApiError::from(InferenceError::MalformedOutput("x".into())).is_fatal_for_stream());
    }

    #[tokio::test]
    async fn test_body_hides_details() {
        let err = ApiError::from(InferenceError::WorkerFailed {
            status: Some(1),
            stderr: "secret traceback".to_string(),
        });
        let response = err.into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("secret"));
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["kind"], "worker_failed");
        assert_eq!(json["error"], "Failed to process file");
    }
}
