//! Backend selection.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::DetectionBackend;
use crate::error::{InferenceError, InferenceResult};
use crate::http::{HttpBackend, HttpBackendConfig};
use crate::process::{ProcessBackend, ProcessBackendConfig};

/// Which detection engine to use.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Spawn a local worker process per invocation
    Process(ProcessBackendConfig),
    /// Post to a hosted detection API
    Http(HttpBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Process(ProcessBackendConfig::default())
    }
}

impl BackendConfig {
    /// Create config from environment variables. `DETECTOR_BACKEND` selects
    /// `process` (default) or `http`.
    pub fn from_env() -> InferenceResult<Self> {
        let kind = std::env::var("DETECTOR_BACKEND").unwrap_or_else(|_| "process".to_string());
        Self::from_kind(&kind)
    }

    fn from_kind(kind: &str) -> InferenceResult<Self> {
        match kind.trim().to_lowercase().as_str() {
            "process" | "local" => Ok(BackendConfig::Process(ProcessBackendConfig::from_env())),
            "http" | "remote" => Ok(BackendConfig::Http(HttpBackendConfig::from_env())),
            other => Err(InferenceError::launch_failed(format!(
                "unknown DETECTOR_BACKEND '{}', expected 'process' or 'http'",
                other
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Process(_) => "process",
            BackendConfig::Http(_) => "http",
        }
    }

    /// Longest a single invocation may hold its artifact.
    pub fn invocation_timeout(&self) -> Duration {
        match self {
            BackendConfig::Process(process) => process.timeout + process.kill_grace,
            BackendConfig::Http(http) => http.timeout,
        }
    }
}

/// Build the configured backend.
pub fn build_backend(config: &BackendConfig) -> InferenceResult<Arc<dyn DetectionBackend>> {
    match config {
        BackendConfig::Process(process) => {
            info!(target = %process.target(), timeout = ?process.timeout, "Using process detection backend");
            Ok(Arc::new(ProcessBackend::new(process.clone())))
        }
        BackendConfig::Http(http) => {
            info!(url = %http.base_url, timeout = ?http.timeout, "Using HTTP detection backend");
            Ok(Arc::new(HttpBackend::new(http.clone())?))
        }
    }
}
