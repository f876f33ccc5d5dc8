//! Detection engine adapters.
//!
//! An adapter hands a staged artifact to an external, already-trained
//! detection engine and normalizes the answer into a `DetectionResult`.
//! Two engines are supported:
//! - a locally spawned worker process (`ProcessBackend`)
//! - a hosted HTTP API (`HttpBackend`)
//!
//! Every invocation runs under a bounded wait and can be cancelled; a worker
//! that overruns is killed and reaped before the call returns.

pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod invocation;
pub mod process;

pub use backend::{cancelled, never_cancel, CancelSignal, DetectionBackend};
pub use config::{build_backend, BackendConfig};
pub use error::{InferenceError, InferenceResult};
pub use http::{HttpBackend, HttpBackendConfig};
pub use invocation::{Invocation, InvocationOutcome, Settled, Termination};
pub use process::{ProcessBackend, ProcessBackendConfig};
