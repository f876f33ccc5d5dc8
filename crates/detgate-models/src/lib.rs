//! Shared data models for the detection gateway.
//!
//! This crate provides Serde-serializable types for:
//! - Staged upload artifacts and their media kind
//! - Normalized detection results and verdict classification
//! - The stable error taxonomy exposed to clients
//! - Streaming session state and wire messages

pub mod artifact;
pub mod detection;
pub mod error_kind;
pub mod session;
pub mod ws;

// Re-export common types
pub use artifact::{ArtifactId, MediaKind, UploadArtifact};
pub use detection::{DetectionResult, OutputError, Verdict};
pub use error_kind::ErrorKind;
pub use session::{ConnectionState, SessionId, StreamSession, TransitionError};
pub use ws::{ClientControl, StreamMessage};
