//! Scratch-directory artifact store.
//!
//! Every staged payload gets a generated file name (`dg-<uuid>[.ext]`), so
//! concurrent requests never share a path and client file names never reach
//! the filesystem. Uniqueness is the only concurrency guarantee needed; the
//! store holds no locks.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use detgate_models::{ArtifactId, MediaKind, UploadArtifact};

use crate::error::{StagingError, StagingResult};

/// File name prefix for every artifact owned by the store.
pub const ARTIFACT_PREFIX: &str = "dg-";

/// Longest file extension carried over from the client-supplied name.
const MAX_EXTENSION_LEN: usize = 8;

/// Prefixed files younger than this are left alone by the startup sweep.
/// Another gateway may share the directory, and its artifacts live no longer
/// than one invocation timeout.
pub const ORPHAN_MIN_AGE: Duration = Duration::from_secs(15 * 60);

struct StoreInner {
    root: PathBuf,
    staged: AtomicU64,
    released: AtomicU64,
}

/// Process-wide scratch store. Cheap to clone.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.inner.root)
            .finish()
    }
}

impl ArtifactStore {
    /// Create the scratch directory if needed and sweep orphaned artifacts
    /// left behind by a previous process.
    pub async fn init(root: impl Into<PathBuf>) -> StagingResult<Self> {
        Self::init_with_orphan_age(root, ORPHAN_MIN_AGE).await
    }

    /// Like [`ArtifactStore::init`], sweeping only prefixed files last
    /// modified at least `orphan_age` ago.
    pub async fn init_with_orphan_age(
        root: impl Into<PathBuf>,
        orphan_age: Duration,
    ) -> StagingResult<Self> {
        let root = root.into();

        fs::create_dir_all(&root)
            .await
            .map_err(|source| StagingError::ScratchDirUnavailable {
                path: root.clone(),
                source,
            })?;

        let swept = sweep_orphans(&root, orphan_age).await;
        if swept > 0 {
            info!(root = %root.display(), swept, "Removed orphaned artifacts");
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                staged: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Number of successful `stage` calls.
    pub fn staged_count(&self) -> u64 {
        self.inner.staged.load(Ordering::SeqCst)
    }

    /// Number of `release` calls, from any path.
    pub fn release_count(&self) -> u64 {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Write `bytes` to a fresh, uniquely named file.
    ///
    /// A partially written file is removed before the error is returned, so a
    /// failed stage leaves nothing behind.
    pub async fn stage(
        &self,
        bytes: &[u8],
        suggested_name: &str,
        media_kind: MediaKind,
    ) -> StagingResult<StagedArtifact> {
        let id = ArtifactId::new();
        let file_name = match sanitized_extension(suggested_name) {
            Some(ext) => format!("{}{}.{}", ARTIFACT_PREFIX, id.as_uuid().simple(), ext),
            None => format!("{}{}", ARTIFACT_PREFIX, id.as_uuid().simple()),
        };
        let path = self.inner.root.join(file_name);

        if let Err(e) = write_new_file(&path, bytes).await {
            if let Err(cleanup) = fs::remove_file(&path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "Failed to remove partial artifact: {}", cleanup);
                }
            }
            return Err(StagingError::disk_write_failed(path, e));
        }

        self.inner.staged.fetch_add(1, Ordering::SeqCst);
        debug!(artifact_id = %id, path = %path.display(), size = bytes.len(), "Staged artifact");

        Ok(StagedArtifact {
            artifact: UploadArtifact {
                id,
                original_name: suggested_name.to_string(),
                storage_path: path,
                size_bytes: bytes.len() as u64,
                media_kind,
                created_at: Utc::now(),
            },
            store: self.clone(),
            released: false,
        })
    }

    /// Delete an artifact's file. Never fails: a missing file is expected
    /// when release runs more than once, and any other error is logged.
    pub async fn release(&self, artifact: &UploadArtifact) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
        match fs::remove_file(&artifact.storage_path).await {
            Ok(()) => debug!(artifact_id = %artifact.id, "Released artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(artifact_id = %artifact.id, "Artifact already gone");
            }
            Err(e) => warn!(
                artifact_id = %artifact.id,
                path = %artifact.storage_path.display(),
                "Failed to delete artifact: {}",
                e
            ),
        }
    }

    fn release_blocking(&self, artifact: &UploadArtifact) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
        match std::fs::remove_file(&artifact.storage_path) {
            Ok(()) => debug!(artifact_id = %artifact.id, "Released artifact on drop"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                artifact_id = %artifact.id,
                path = %artifact.storage_path.display(),
                "Failed to delete artifact on drop: {}",
                e
            ),
        }
    }

    /// Verify the scratch directory still accepts writes.
    pub async fn check_writable(&self) -> StagingResult<()> {
        let probe = self
            .inner
            .root
            .join(format!("{}probe-{}", ARTIFACT_PREFIX, ArtifactId::new().as_uuid().simple()));
        write_new_file(&probe, b"ok")
            .await
            .map_err(|source| StagingError::ScratchDirUnavailable {
                path: self.inner.root.clone(),
                source,
            })?;
        if let Err(e) = fs::remove_file(&probe).await {
            warn!(path = %probe.display(), "Failed to remove write probe: {}", e);
        }
        Ok(())
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    Ok(())
}

/// Remove prefixed files in `root` older than `min_age`. Returns how many
/// were removed.
async fn sweep_orphans(root: &Path, min_age: Duration) -> usize {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), "Failed to scan scratch directory: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(ARTIFACT_PREFIX) {
            continue;
        }
        let age = entry
            .metadata()
            .await
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        match age {
            Some(age) if age >= min_age => {}
            _ => continue,
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), "Failed to remove orphan: {}", e),
        }
    }
    removed
}

/// Keep a short alphanumeric extension so engines that sniff by extension
/// still work. Everything else about the client name is discarded.
fn sanitized_extension(suggested_name: &str) -> Option<String> {
    let ext = Path::new(suggested_name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > MAX_EXTENSION_LEN || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A staged artifact owned by exactly one request.
///
/// Call [`StagedArtifact::release`] on every exit path. If the owner is
/// dropped without releasing (task cancellation, panic), the file is removed
/// synchronously in `Drop`. Either way the file is deleted exactly once.
pub struct StagedArtifact {
    artifact: UploadArtifact,
    store: ArtifactStore,
    released: bool,
}

impl StagedArtifact {
    pub fn artifact(&self) -> &UploadArtifact {
        &self.artifact
    }

    /// Delete the staged file. Consumes the guard, so the artifact cannot be
    /// handed to an engine afterwards.
    pub async fn release(mut self) {
        self.released = true;
        self.store.release(&self.artifact).await;
    }
}

impl Deref for StagedArtifact {
    type Target = UploadArtifact;

    fn deref(&self) -> &Self::Target {
        &self.artifact
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.released {
            self.store.release_blocking(&self.artifact);
        }
    }
}
