//! Prometheus metrics for the gateway.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "detgate_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "detgate_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "detgate_http_requests_in_flight";

    // Detection metrics
    pub const DETECTIONS_TOTAL: &str = "detgate_detections_total";
    pub const INFERENCE_DURATION_SECONDS: &str = "detgate_inference_duration_seconds";
    pub const VERDICTS_TOTAL: &str = "detgate_verdicts_total";

    // Scratch directory metrics
    pub const ARTIFACTS_STAGED_TOTAL: &str = "detgate_artifacts_staged_total";
    pub const ARTIFACTS_RELEASED_TOTAL: &str = "detgate_artifacts_released_total";

    // Streaming metrics
    pub const STREAM_SESSIONS_TOTAL: &str = "detgate_stream_sessions_total";
    pub const STREAM_SESSIONS_ACTIVE: &str = "detgate_stream_sessions_active";
    pub const STREAM_FRAMES_TOTAL: &str = "detgate_stream_frames_total";
    pub const STREAM_MESSAGES_SENT: &str = "detgate_stream_messages_sent_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "detgate_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a finished detection; `outcome` is `ok` or an error kind.
pub fn record_detection(backend: &str, outcome: &str, duration_secs: f64) {
    let labels = [
        ("backend", backend.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(names::DETECTIONS_TOTAL, &labels).increment(1);
    histogram!(names::INFERENCE_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record the verdict of a successful detection.
pub fn record_verdict(verdict: &str) {
    let labels = [("verdict", verdict.to_string())];
    counter!(names::VERDICTS_TOTAL, &labels).increment(1);
}

pub fn record_artifact_staged() {
    counter!(names::ARTIFACTS_STAGED_TOTAL).increment(1);
}

pub fn record_artifact_released() {
    counter!(names::ARTIFACTS_RELEASED_TOTAL).increment(1);
}

/// Record a new stream session.
pub fn record_stream_session() {
    counter!(names::STREAM_SESSIONS_TOTAL).increment(1);
}

/// Update active stream sessions gauge.
pub fn set_stream_sessions_active(count: i64) {
    gauge!(names::STREAM_SESSIONS_ACTIVE).set(count as f64);
}

/// Record an inbound frame; `disposition` is `accepted` or `dropped`.
pub fn record_frame(disposition: &str) {
    let labels = [("disposition", disposition.to_string())];
    counter!(names::STREAM_FRAMES_TOTAL, &labels).increment(1);
}

/// Record a message sent on a stream session.
pub fn record_stream_message_sent(message_type: &str) {
    let labels = [("type", message_type.to_string())];
    counter!(names::STREAM_MESSAGES_SENT, &labels).increment(1);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", endpoint.to_string())];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Metrics middleware for HTTP requests.
///
/// Paths are labelled by the matched route template to keep cardinality
/// bounded.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
