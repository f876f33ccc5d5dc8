//! Child-process detection backend.
//!
//! The worker receives the staged artifact path as its last positional
//! argument and must print exactly one JSON document on stdout before
//! exiting 0. stderr is captured for logs only.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use detgate_models::{DetectionResult, UploadArtifact};

use crate::backend::{cancelled, CancelSignal, DetectionBackend};
use crate::error::InferenceResult;
use crate::invocation::{Invocation, Termination};

/// Per-stream capture limit. Excess output is drained and discarded so the
/// worker never blocks on a full pipe.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Configuration for the process backend.
#[derive(Debug, Clone)]
pub struct ProcessBackendConfig {
    /// Program to execute (looked up on PATH)
    pub program: String,
    /// Arguments placed before the artifact path
    pub args: Vec<String>,
    /// Bounded wait for one invocation
    pub timeout: Duration,
    /// Time allowed for a killed worker to be reaped
    pub kill_grace: Duration,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["python/ai_model.py".to_string()],
            timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessBackendConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            program: std::env::var("DETECTOR_PROGRAM").unwrap_or(defaults.program),
            args: std::env::var("DETECTOR_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.args),
            timeout: Duration::from_secs(
                std::env::var("DETECTOR_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            kill_grace: Duration::from_millis(
                std::env::var("DETECTOR_KILL_GRACE_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
            ),
        }
    }

    /// Description of the command line, without the artifact path.
    pub fn target(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Runs the detector as a child process per invocation.
pub struct ProcessBackend {
    config: ProcessBackendConfig,
}

enum WaitResult {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessBackend {
    pub fn new(config: ProcessBackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessBackendConfig {
        &self.config
    }

    fn command(&self, artifact: &UploadArtifact) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg(artifact.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so a kill reaches interpreter grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Kill the worker (and its group) and wait for it to be reaped.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        kill_group(pid);
        if let Err(e) = child.start_kill() {
            debug!("start_kill after group kill: {}", e);
        }

        match tokio::time::timeout(self.config.kill_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Worker reaped after kill"),
            Ok(Err(e)) => warn!("Failed to reap killed worker: {}", e),
            Err(_) => warn!(
                grace_ms = self.config.kill_grace.as_millis() as u64,
                "Killed worker was not reaped within grace period"
            ),
        }
    }

    async fn collect(&self, handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
        let Some(mut handle) = handle else {
            return Vec::new();
        };
        match tokio::time::timeout(self.config.kill_grace, &mut handle).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("Output capture task failed: {}", e);
                Vec::new()
            }
            Err(_) => {
                // A stray descendant still holds the pipe open.
                handle.abort();
                warn!("Output capture did not finish within grace period");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl DetectionBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn detect(
        &self,
        artifact: &UploadArtifact,
        mut cancel: CancelSignal,
    ) -> InferenceResult<DetectionResult> {
        let mut invocation = Invocation::start(artifact, self.config.target());

        let mut child = match self.command(artifact).spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("{}: {}", self.config.program, e);
                return invocation.settle(Termination::LaunchFailed(reason)).into_result();
            }
        };

        // Captured now: `Child::id` is gone once the child has been reaped.
        let pid = child.id();
        let stdout = child.stdout.take().map(|out| tokio::spawn(capture(out, MAX_CAPTURE_BYTES)));
        let stderr = child.stderr.take().map(|err| tokio::spawn(capture(err, MAX_CAPTURE_BYTES)));

        let waited = tokio::select! {
            status = child.wait() => WaitResult::Exited(status),
            _ = tokio::time::sleep(self.config.timeout) => WaitResult::TimedOut,
            _ = cancelled(&mut cancel) => WaitResult::Cancelled,
        };

        let termination = match waited {
            WaitResult::Exited(Ok(status)) => {
                // Sweep anything the worker left running in its group.
                kill_group(pid);
                Termination::Exited { code: status.code() }
            }
            WaitResult::Exited(Err(e)) => {
                self.terminate(&mut child, pid).await;
                Termination::LaunchFailed(format!("failed to wait for worker: {}", e))
            }
            WaitResult::TimedOut => {
                warn!(
                    artifact_id = %artifact.id,
                    timeout_secs = self.config.timeout.as_secs_f64(),
                    "Detector timed out, killing process"
                );
                self.terminate(&mut child, pid).await;
                Termination::TimedOut(self.config.timeout)
            }
            WaitResult::Cancelled => {
                info!(artifact_id = %artifact.id, "Detector cancelled, killing process");
                self.terminate(&mut child, pid).await;
                Termination::Cancelled
            }
        };

        let stdout = self.collect(stdout).await;
        let stderr = self.collect(stderr).await;
        invocation.record_output(stdout, stderr);

        invocation.settle(termination).into_result()
    }

    async fn health_check(&self) -> bool {
        which::which(&self.config.program).is_ok()
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes.
async fn capture<R>(mut reader: R, cap: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    kept
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        // ESRCH just means the group is already empty.
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                debug!(pid, "killpg failed: {}", e);
            }
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
