//! Gateway configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use detgate_inference::{BackendConfig, InferenceError};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid detector configuration: {0}")]
    Detector(#[from] InferenceError),
}

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Scratch directory for staged artifacts
    pub scratch_dir: PathBuf,
    /// Detection engine selection and settings
    pub backend: BackendConfig,
    /// Minimum spacing between accepted stream frames
    pub frame_interval: Duration,
    /// Stream sessions close after this long without an inbound message
    pub idle_timeout: Duration,
    /// Largest accepted stream frame
    pub max_frame_bytes: usize,
    /// Max request body size
    pub max_body_size: usize,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Rate limit requests per second per client IP
    pub rate_limit_rps: u32,
    /// Accepted API keys; empty disables authentication
    pub api_keys: Vec<String>,
    /// Environment (development/production)
    pub environment: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            scratch_dir: default_scratch_dir(),
            backend: BackendConfig::default(),
            frame_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(60),
            max_frame_bytes: 5 * 1024 * 1024,  // 5MB
            max_body_size: 20 * 1024 * 1024,   // 20MB
            cors_origins: vec!["*".to_string()],
            rate_limit_rps: 10,
            api_keys: Vec::new(),
            environment: "development".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("GATEWAY_PORT").unwrap_or(8080),
            scratch_dir: std::env::var("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_scratch_dir()),
            backend: BackendConfig::from_env()?,
            frame_interval: Duration::from_millis(env_parse("STREAM_FRAME_INTERVAL_MS").unwrap_or(500)),
            idle_timeout: Duration::from_secs(env_parse("STREAM_IDLE_TIMEOUT_SECS").unwrap_or(60)),
            max_frame_bytes: env_parse("MAX_FRAME_BYTES").unwrap_or(5 * 1024 * 1024),
            max_body_size: env_parse("MAX_BODY_SIZE").unwrap_or(20 * 1024 * 1024),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| split_list(&s))
                .unwrap_or_else(|_| vec!["*".to_string()]),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS").unwrap_or(10),
            api_keys: std::env::var("GATEWAY_API_KEYS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        })
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("detgate")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
