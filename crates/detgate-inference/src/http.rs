//! Hosted detection API backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use detgate_models::{DetectionResult, UploadArtifact};

use crate::backend::{cancelled, CancelSignal, DetectionBackend};
use crate::error::{InferenceError, InferenceResult};
use crate::invocation::{Invocation, Termination};

/// Multipart field carrying the payload, as the hosted API expects it.
const UPLOAD_FIELD: &str = "image";

/// Configuration for the hosted API backend.
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL of the detection service
    pub base_url: String,
    /// Path of the detection route
    pub detect_path: String,
    /// Value for the `x-api-key` header, if the service wants one
    pub api_key: Option<String>,
    /// Bounded wait for one invocation, retries included
    pub timeout: Duration,
    /// Retries for requests that never reached the service
    pub max_retries: u32,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            detect_path: "/detect".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            max_retries: 1,
        }
    }
}

impl HttpBackendConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("DETECTOR_URL")
                .unwrap_or_else(|_| "http://localhost:8001".to_string()),
            detect_path: std::env::var("DETECTOR_PATH").unwrap_or_else(|_| "/detect".to_string()),
            api_key: std::env::var("DETECTOR_API_KEY").ok().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(
                std::env::var("DETECTOR_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            max_retries: std::env::var("DETECTOR_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        }
    }

    fn detect_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.detect_path)
    }
}

/// Client for a hosted detection API.
pub struct HttpBackend {
    http: Client,
    config: HttpBackendConfig,
}

enum Exchange {
    Answered(StatusCode, String),
    Unreachable(reqwest::Error),
    TimedOut,
    Cancelled,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> InferenceResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| InferenceError::launch_failed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> InferenceResult<Self> {
        Self::new(HttpBackendConfig::from_env())
    }

    async fn post_once(
        &self,
        url: &str,
        artifact: &UploadArtifact,
        bytes: Vec<u8>,
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let part = Part::bytes(bytes)
            .file_name(artifact.stored_name())
            .mime_str(artifact.media_kind.default_mime())?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        let mut request = self.http.post(url).multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }

    /// Post with retry for requests that never reached the service.
    async fn post_with_retry(
        &self,
        url: &str,
        artifact: &UploadArtifact,
        bytes: &[u8],
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let mut attempt = 0;
        loop {
            match self.post_once(url, artifact, bytes.to_vec()).await {
                Err(e) if e.is_connect() && attempt < self.config.max_retries => {
                    let delay = Duration::from_millis(200 * 2u64.pow(attempt));
                    warn!(
                        "Detection API unreachable (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl DetectionBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn detect(
        &self,
        artifact: &UploadArtifact,
        mut cancel: CancelSignal,
    ) -> InferenceResult<DetectionResult> {
        let url = self.config.detect_url();
        let mut invocation = Invocation::start(artifact, url.clone());

        let bytes = match tokio::fs::read(artifact.path()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let reason = format!("failed to read staged artifact: {}", e);
                return invocation.settle(Termination::LaunchFailed(reason)).into_result();
            }
        };

        debug!(artifact_id = %artifact.id, url = %url, "Posting artifact to detection API");

        let bounded = tokio::time::timeout(
            self.config.timeout,
            self.post_with_retry(&url, artifact, &bytes),
        );

        let exchange = tokio::select! {
            res = bounded => match res {
                Ok(Ok((status, body))) => Exchange::Answered(status, body),
                Ok(Err(e)) if e.is_timeout() => Exchange::TimedOut,
                Ok(Err(e)) => Exchange::Unreachable(e),
                Err(_) => Exchange::TimedOut,
            },
            _ = cancelled(&mut cancel) => Exchange::Cancelled,
        };

        let termination = match exchange {
            Exchange::Answered(status, body) => {
                if status.is_success() {
                    invocation.record_output(body.into_bytes(), Vec::new());
                } else {
                    invocation.record_output(Vec::new(), body.into_bytes());
                }
                Termination::Responded {
                    status: status.as_u16(),
                }
            }
            Exchange::Unreachable(e) => Termination::LaunchFailed(e.to_string()),
            Exchange::TimedOut => Termination::TimedOut(self.config.timeout),
            Exchange::Cancelled => Termination::Cancelled,
        };

        invocation.settle(termination).into_result()
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.config.base_url.trim_end_matches('/'));

        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("Detection API health check failed: {}", response.status());
                false
            }
            Err(e) => {
                warn!("Detection API health check error: {}", e);
                false
            }
        }
    }
}
