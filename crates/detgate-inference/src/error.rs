//! Inference error types.

use std::time::Duration;

use thiserror::Error;

use detgate_models::ErrorKind;

pub type InferenceResult<T> = Result<T, InferenceError>;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("failed to launch detector: {0}")]
    LaunchFailed(String),

    #[error("detector failed with {}", describe_status(.status))]
    WorkerFailed {
        /// Exit code, HTTP status, or `None` when killed by a signal
        status: Option<i32>,
        /// Captured diagnostic output; for server-side logs only
        stderr: String,
    },

    #[error("malformed detector output: {0}")]
    MalformedOutput(String),

    #[error("detector timed out after {0:?}")]
    Timeout(Duration),

    #[error("invocation cancelled")]
    Cancelled,
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "termination by signal".to_string(),
    }
}

impl InferenceError {
    pub fn launch_failed(reason: impl Into<String>) -> Self {
        Self::LaunchFailed(reason.into())
    }

    /// Stable taxonomy kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::LaunchFailed(_) => ErrorKind::LaunchFailed,
            InferenceError::WorkerFailed { .. } => ErrorKind::WorkerFailed,
            InferenceError::MalformedOutput(_) => ErrorKind::MalformedOutput,
            InferenceError::Timeout(_) => ErrorKind::Timeout,
            InferenceError::Cancelled => ErrorKind::TransportError,
        }
    }

    /// Worker status for `WorkerFailed`, if any.
    pub fn worker_status(&self) -> Option<i32> {
        match self {
            InferenceError::WorkerFailed { status, .. } => *status,
            _ => None,
        }
    }
}
