//! Detection pipeline shared by the single-shot endpoint and the streaming
//! channel: stage, invoke, release.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, trace};

use detgate_inference::{never_cancel, CancelSignal, DetectionBackend};
use detgate_models::{DetectionResult, MediaKind};
use detgate_storage::ArtifactStore;

use crate::error::{ApiError, ApiResult};
use crate::metrics;

/// Phase of one detection request.
///
/// `Received → Staged → Invoking → Responding → Done`, with a side branch
/// into `Aborting` from every post-staging phase. The staged artifact is
/// released before `Done` on both branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Staged,
    Invoking,
    Responding,
    Aborting,
    Done,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestPhase::Received => "received",
            RequestPhase::Staged => "staged",
            RequestPhase::Invoking => "invoking",
            RequestPhase::Responding => "responding",
            RequestPhase::Aborting => "aborting",
            RequestPhase::Done => "done",
        }
    }

    pub fn can_advance_to(&self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Received, Staged)
                // Staging failed; nothing to release
                | (Received, Done)
                | (Staged, Invoking)
                | (Invoking, Responding)
                | (Responding, Done)
                | (Staged, Aborting)
                | (Invoking, Aborting)
                | (Responding, Aborting)
                | (Aborting, Done)
        )
    }
}

struct PhaseTracker {
    phase: RequestPhase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            phase: RequestPhase::Received,
        }
    }

    fn advance(&mut self, next: RequestPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal request phase transition {} -> {}",
            self.phase.as_str(),
            next.as_str()
        );
        trace!(from = self.phase.as_str(), to = next.as_str(), "Request phase");
        self.phase = next;
    }
}

/// One payload submitted for detection.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub bytes: Vec<u8>,
    /// Client-supplied name; display only, never used as a path
    pub file_name: String,
    pub media_kind: MediaKind,
}

/// Runs the stage → invoke → release pipeline.
#[derive(Clone)]
pub struct DetectionService {
    store: ArtifactStore,
    backend: Arc<dyn DetectionBackend>,
}

impl DetectionService {
    pub fn new(store: ArtifactStore, backend: Arc<dyn DetectionBackend>) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn DetectionBackend> {
        &self.backend
    }

    /// Run the pipeline in its own task and wait for it.
    ///
    /// If the caller is dropped (client disconnect), the task keeps going
    /// and still releases the artifact.
    pub async fn detect_detached(&self, upload: MediaUpload) -> ApiResult<DetectionResult> {
        let service = self.clone();
        tokio::spawn(async move { service.detect(upload, never_cancel()).await })
            .await
            .map_err(|e| ApiError::internal(format!("detection task failed: {}", e)))?
    }

    /// Stage the payload, run the backend, release the artifact.
    ///
    /// Release runs exactly once on every path that staged something.
    pub async fn detect(&self, upload: MediaUpload, cancel: CancelSignal) -> ApiResult<DetectionResult> {
        let mut phase = PhaseTracker::new();

        let staged = match self
            .store
            .stage(&upload.bytes, &upload.file_name, upload.media_kind)
            .await
        {
            Ok(staged) => staged,
            Err(e) => {
                phase.advance(RequestPhase::Done);
                return Err(e.into());
            }
        };
        metrics::record_artifact_staged();
        phase.advance(RequestPhase::Staged);

        let artifact_id = staged.id;
        phase.advance(RequestPhase::Invoking);
        let started = Instant::now();
        let result = self.backend.detect(staged.artifact(), cancel).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(detection) => {
                phase.advance(RequestPhase::Responding);
                let verdict = detection.verdict();
                metrics::record_detection(self.backend.name(), "ok", elapsed.as_secs_f64());
                metrics::record_verdict(verdict.as_str());
                info!(
                    artifact_id = %artifact_id,
                    media_kind = upload.media_kind.as_str(),
                    size_bytes = upload.bytes.len(),
                    label = %detection.label,
                    verdict = %verdict,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Detection completed"
                );
            }
            Err(e) => {
                phase.advance(RequestPhase::Aborting);
                metrics::record_detection(self.backend.name(), e.kind().as_str(), elapsed.as_secs_f64());
                debug!(artifact_id = %artifact_id, kind = %e.kind(), "Detection aborted: {}", e);
            }
        }

        staged.release().await;
        metrics::record_artifact_released();
        phase.advance(RequestPhase::Done);

        result.map_err(ApiError::from)
    }
}
