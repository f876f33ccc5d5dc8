//! Per-invocation state machine.
//!
//! An [`Invocation`] starts `Pending` and is settled exactly once. Settling
//! consumes it, so there is no way to observe or re-settle an invocation
//! after it reached a terminal outcome. Whatever order the underlying engine
//! reports exit and I/O completion in, the backend funnels it into a single
//! [`Termination`] first.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use detgate_models::{ArtifactId, DetectionResult, OutputError, UploadArtifact};

use crate::error::{InferenceError, InferenceResult};

/// Longest stderr excerpt written to logs.
const STDERR_LOG_LIMIT: usize = 2048;

/// Invocation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationOutcome {
    /// Engine still running
    Pending,
    /// Engine answered with a usable result
    Succeeded,
    /// Engine could not start, reported failure, or answered garbage
    Failed,
    /// Engine was killed (signal, timeout, cancellation)
    Crashed,
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcome::Pending => "pending",
            InvocationOutcome::Succeeded => "succeeded",
            InvocationOutcome::Failed => "failed",
            InvocationOutcome::Crashed => "crashed",
        }
    }
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the engine run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Process exited; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
    /// Hosted engine answered with an HTTP status
    Responded { status: u16 },
    /// Engine could not be started or reached
    LaunchFailed(String),
    /// Bounded wait elapsed and the engine was terminated
    TimedOut(Duration),
    /// Caller withdrew and the engine was terminated
    Cancelled,
}

/// One call into a detection engine.
#[derive(Debug)]
pub struct Invocation {
    artifact_id: ArtifactId,
    target: String,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    started_at: Instant,
}

/// Terminal record of an invocation.
#[derive(Debug)]
pub struct Settled {
    pub artifact_id: ArtifactId,
    pub outcome: InvocationOutcome,
    pub exit_status: Option<i32>,
    pub elapsed: Duration,
    pub result: InferenceResult<DetectionResult>,
}

impl Invocation {
    pub fn start(artifact: &UploadArtifact, target: impl Into<String>) -> Self {
        let target = target.into();
        debug!(
            artifact_id = %artifact.id,
            target = %target,
            outcome = %InvocationOutcome::Pending,
            "Invocation started"
        );
        Self {
            artifact_id: artifact.id,
            target,
            stdout: Vec::new(),
            stderr: Vec::new(),
            started_at: Instant::now(),
        }
    }

    /// Attach the engine's primary (data) and secondary (diagnostic) output.
    pub fn record_output(&mut self, stdout: Vec<u8>, stderr: Vec<u8>) {
        self.stdout = stdout;
        self.stderr = stderr;
    }

    /// Map the termination to a terminal outcome and result.
    pub fn settle(self, termination: Termination) -> Settled {
        let elapsed = self.started_at.elapsed();
        let stderr = String::from_utf8_lossy(&self.stderr).into_owned();

        let (outcome, exit_status, result) = match termination {
            Termination::Exited { code: Some(0) } => {
                let (outcome, result) = self.parse_stdout();
                (outcome, Some(0), result)
            }
            Termination::Responded { status } if (200..300).contains(&status) => {
                let (outcome, result) = self.parse_stdout();
                (outcome, Some(i32::from(status)), result)
            }
            Termination::Exited { code: Some(code) } => (
                InvocationOutcome::Failed,
                Some(code),
                Err(InferenceError::WorkerFailed {
                    status: Some(code),
                    stderr: stderr.clone(),
                }),
            ),
            Termination::Responded { status } => (
                InvocationOutcome::Failed,
                Some(i32::from(status)),
                Err(InferenceError::WorkerFailed {
                    status: Some(i32::from(status)),
                    stderr: stderr.clone(),
                }),
            ),
            Termination::Exited { code: None } => (
                InvocationOutcome::Crashed,
                None,
                Err(InferenceError::WorkerFailed {
                    status: None,
                    stderr: stderr.clone(),
                }),
            ),
            Termination::LaunchFailed(reason) => (
                InvocationOutcome::Failed,
                None,
                Err(InferenceError::LaunchFailed(reason)),
            ),
            Termination::TimedOut(after) => (
                InvocationOutcome::Crashed,
                None,
                Err(InferenceError::Timeout(after)),
            ),
            Termination::Cancelled => (InvocationOutcome::Crashed, None, Err(InferenceError::Cancelled)),
        };

        match &result {
            Ok(_) | Err(InferenceError::Cancelled) => {}
            Err(e) => warn!(
                artifact_id = %self.artifact_id,
                target = %self.target,
                outcome = %outcome,
                elapsed_ms = elapsed.as_millis() as u64,
                stderr = %excerpt(&stderr),
                "Invocation failed: {}",
                e
            ),
        }

        Settled {
            artifact_id: self.artifact_id,
            outcome,
            exit_status,
            elapsed,
            result,
        }
    }

    fn parse_stdout(&self) -> (InvocationOutcome, InferenceResult<DetectionResult>) {
        let stdout = String::from_utf8_lossy(&self.stdout);
        match DetectionResult::parse(&stdout) {
            Ok(detection) => (InvocationOutcome::Succeeded, Ok(detection)),
            Err(e) => {
                if let OutputError::Reported(reported) = &e {
                    warn!(artifact_id = %self.artifact_id, "Detector reported error: {}", reported);
                } else {
                    debug!(artifact_id = %self.artifact_id, stdout = %excerpt(&stdout), "Unparseable detector output");
                }
                (
                    InvocationOutcome::Failed,
                    Err(InferenceError::MalformedOutput(e.to_string())),
                )
            }
        }
    }
}

impl Settled {
    /// Record the terminal outcome and hand back the result.
    pub fn into_result(self) -> InferenceResult<DetectionResult> {
        let elapsed_ms = self.elapsed.as_millis() as u64;
        match &self.result {
            Ok(detection) => debug!(
                artifact_id = %self.artifact_id,
                outcome = %self.outcome,
                exit_status = ?self.exit_status,
                elapsed_ms,
                label = %detection.label,
                "Invocation settled"
            ),
            Err(e) => debug!(
                artifact_id = %self.artifact_id,
                outcome = %self.outcome,
                exit_status = ?self.exit_status,
                elapsed_ms,
                kind = %e.kind(),
                "Invocation settled"
            ),
        }
        self.result
    }
}

fn excerpt(text: &str) -> &str {
    if text.len() <= STDERR_LOG_LIMIT {
        return text.trim_end();
    }
    let mut end = STDERR_LOG_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
