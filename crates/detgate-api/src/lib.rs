//! Axum detection gateway.
//!
//! This crate provides:
//! - `POST /api/detect`: single-shot multipart upload, staged, detected, released
//! - `GET /ws/detect`: streaming channel accepting binary camera frames
//! - Pluggable request authentication
//! - Rate limiting, security headers and Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;
pub mod ws;

pub use auth::{AllowAll, ApiKeyAuth, RequestAuthenticator};
pub use config::{ConfigError, GatewayConfig};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::{DetectionService, MediaUpload};
pub use state::AppState;
