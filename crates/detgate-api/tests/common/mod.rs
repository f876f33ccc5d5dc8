//! Shared fixtures for gateway integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;

use detgate_api::{auth, create_router, AppState, GatewayConfig};
use detgate_inference::{cancelled, CancelSignal, DetectionBackend, InferenceError, InferenceResult};
use detgate_models::{DetectionResult, UploadArtifact};
use detgate_storage::ArtifactStore;

pub const BOUNDARY: &str = "detgate-test-boundary";

/// What a [`FakeBackend`] does on each call.
#[derive(Clone)]
pub enum Behavior {
    /// Answer with a label immediately
    Label(&'static str),
    /// Always fail
    Fail(fn() -> InferenceError),
    /// Fail the first call, answer later calls with a label
    FailFirst(fn() -> InferenceError, &'static str),
    /// Answer after a delay unless cancelled
    Slow(Duration, &'static str),
    /// Block until cancelled
    WaitForCancel,
    Panic,
}

/// Counting, fault-injectable backend.
pub struct FakeBackend {
    behavior: Behavior,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub cancellations: AtomicUsize,
    /// Calls that found the staged file missing
    pub missing_artifacts: AtomicUsize,
}

impl FakeBackend {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancellations: AtomicUsize::new(0),
            missing_artifacts: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }

    fn withdraw(&self) -> InferenceResult<DetectionResult> {
        self.cancellations.fetch_add(1, Ordering::SeqCst);
        Err(InferenceError::Cancelled)
    }
}

#[async_trait]
impl DetectionBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn detect(
        &self,
        artifact: &UploadArtifact,
        mut cancel: CancelSignal,
    ) -> InferenceResult<DetectionResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !artifact.path().exists() {
            self.missing_artifacts.fetch_add(1, Ordering::SeqCst);
        }

        let result = match self.behavior.clone() {
            Behavior::Label(label) => Ok(DetectionResult::new(label)),
            Behavior::Fail(make) => Err(make()),
            Behavior::FailFirst(make, label) => {
                if call == 0 {
                    Err(make())
                } else {
                    Ok(DetectionResult::new(label))
                }
            }
            Behavior::Slow(delay, label) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(DetectionResult::new(label)),
                    _ = cancelled(&mut cancel) => self.withdraw(),
                }
            }
            Behavior::WaitForCancel => {
                cancelled(&mut cancel).await;
                self.withdraw()
            }
            Behavior::Panic => panic!("detector exploded"),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// A gateway wired to a backend and a private scratch directory.
pub struct TestGateway {
    pub scratch: TempDir,
    pub state: AppState,
    pub router: Router,
}

impl TestGateway {
    pub async fn new(backend: Arc<dyn DetectionBackend>) -> Self {
        Self::with_config(backend, test_config()).await
    }

    pub async fn with_config(backend: Arc<dyn DetectionBackend>, mut config: GatewayConfig) -> Self {
        let scratch = TempDir::new().unwrap();
        config.scratch_dir = scratch.path().to_path_buf();
        let store = ArtifactStore::init(scratch.path()).await.unwrap();
        let authenticator = auth::from_keys(&config.api_keys);
        let state = AppState::with_parts(config, store, backend, authenticator);
        let router = create_router(state.clone(), None);
        Self {
            scratch,
            state,
            router,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        self.state.store()
    }

    /// Serve on an ephemeral port.
    pub async fn spawn(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        frame_interval: Duration::ZERO,
        rate_limit_rps: 1000,
        ..GatewayConfig::default()
    }
}

/// Build a multipart body with a single part.
pub fn multipart_body(field: &str, file_name: Option<&str>, content_type: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    match file_name {
        Some(name) => body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, name
            )
            .as_bytes(),
        ),
        None => body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n", field).as_bytes(),
        ),
    }
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={}", BOUNDARY)
}

/// A JPEG-looking payload of `len` bytes.
pub fn fake_jpeg(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    data[..4].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
    let tail = len - 2;
    data[tail..].copy_from_slice(&[0xFF, 0xD9]);
    data
}

pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
