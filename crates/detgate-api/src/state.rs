//! Application state.

use std::sync::Arc;

use detgate_inference::{build_backend, DetectionBackend};
use detgate_storage::{ArtifactStore, ORPHAN_MIN_AGE};

use crate::auth::{self, RequestAuthenticator};
use crate::config::GatewayConfig;
use crate::services::DetectionService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub detector: DetectionService,
    pub auth: Arc<dyn RequestAuthenticator>,
}

impl AppState {
    /// Create state from config: prepare the scratch directory and build the
    /// configured backend.
    pub async fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        // Another gateway may share the scratch dir; leave anything that
        // could still belong to one of its invocations.
        let orphan_age = ORPHAN_MIN_AGE.max(config.backend.invocation_timeout() * 2);
        let store = ArtifactStore::init_with_orphan_age(config.scratch_dir.clone(), orphan_age).await?;
        let backend = build_backend(&config.backend)?;
        let auth = auth::from_keys(&config.api_keys);
        Ok(Self::with_parts(config, store, backend, auth))
    }

    /// Assemble state from already-built parts.
    pub fn with_parts(
        config: GatewayConfig,
        store: ArtifactStore,
        backend: Arc<dyn DetectionBackend>,
        auth: Arc<dyn RequestAuthenticator>,
    ) -> Self {
        Self {
            config,
            detector: DetectionService::new(store, backend),
            auth,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        self.detector.store()
    }
}
