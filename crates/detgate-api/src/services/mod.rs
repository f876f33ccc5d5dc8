//! Business logic services.

pub mod detection;

pub use detection::{DetectionService, MediaUpload, RequestPhase};
