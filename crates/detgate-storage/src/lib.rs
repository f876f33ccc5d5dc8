//! Temporary artifact staging.
//!
//! This crate provides:
//! - Collision-free staging of client payloads under one scratch directory
//! - A guard type that releases the staged file on every exit path
//! - Startup sweep of orphaned artifacts

pub mod error;
pub mod store;

pub use error::{StagingError, StagingResult};
pub use store::{ArtifactStore, StagedArtifact, ARTIFACT_PREFIX, ORPHAN_MIN_AGE};
