//! Staging error types.

use std::path::PathBuf;
use thiserror::Error;

pub type StagingResult<T> = Result<T, StagingError>;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to write artifact {path}: {source}")]
    DiskWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("scratch directory {path} unavailable: {source}")]
    ScratchDirUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StagingError {
    pub fn disk_write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DiskWriteFailed {
            path: path.into(),
            source,
        }
    }
}
