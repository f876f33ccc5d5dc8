//! Stable error taxonomy exposed to clients.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Machine-readable error kind.
///
/// The serialized names are part of the public wire contract and must not
/// change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Payload absent or not a file
    InvalidInput,
    /// Authentication check rejected the request
    Unauthorized,
    /// Client exceeded its request budget
    RateLimited,
    /// Payload could not be written to the scratch directory
    StagingError,
    /// Detection engine could not be started or reached
    LaunchFailed,
    /// Detection engine exited with a failure status
    WorkerFailed,
    /// Detection engine succeeded but its output was unusable
    MalformedOutput,
    /// Detection engine exceeded the bounded wait
    Timeout,
    /// Streaming connection failed
    TransportError,
    /// Anything else
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::StagingError => "staging_error",
            ErrorKind::LaunchFailed => "launch_failed",
            ErrorKind::WorkerFailed => "worker_failed",
            ErrorKind::MalformedOutput => "malformed_output",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::Internal => "internal",
        }
    }

    /// Generic client-facing message. Never includes engine diagnostics.
    pub fn public_message(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "Invalid or missing file",
            ErrorKind::Unauthorized => "Missing or invalid API key",
            ErrorKind::RateLimited => "Rate limit exceeded. Please try again later.",
            ErrorKind::StagingError
            | ErrorKind::LaunchFailed
            | ErrorKind::WorkerFailed
            | ErrorKind::MalformedOutput
            | ErrorKind::Internal => "Failed to process file",
            ErrorKind::Timeout => "Detection timed out",
            ErrorKind::TransportError => "Connection error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
