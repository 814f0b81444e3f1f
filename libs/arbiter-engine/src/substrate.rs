/// Isolation Substrate - the seam between the orchestrator and the container runtime
///
/// The orchestrator never talks to Docker directly. It asks a substrate to
/// create an environment from an [`EnvironmentSpec`], run commands in it, and
/// destroy it. Production uses [`crate::docker::DockerSubstrate`]; tests use
/// an in-memory fake.
///
/// Enforcement of no-network, non-root and the resource ceilings is the
/// substrate's job. The provisioner only guarantees they are requested.
use crate::output::OutputBuffer;
use crate::registry::ResourceLimits;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Read-only mount point of the staged submission inside a sandbox
pub const SUBMISSION_DIR: &str = "/submission";
/// Writable, size-bounded scratch space inside a sandbox
pub const WORKSPACE_DIR: &str = "/workspace";

pub const LABEL_MANAGED: &str = "arbiter.managed";
pub const LABEL_SUBMISSION: &str = "arbiter.submission";
pub const LABEL_LANGUAGE: &str = "arbiter.language";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnvironmentId(pub String);

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a substrate needs to create one sandbox.
///
/// `limits` is not optional: an environment cannot be described without them.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub name: String,
    pub image: String,
    /// uid[:gid] the sandboxed processes run as
    pub user: String,
    pub limits: ResourceLimits,
    /// Host directory mounted read-only at [`SUBMISSION_DIR`]
    pub submission_source: PathBuf,
    pub network_disabled: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => f.write_str("compile"),
            Phase::Run => f.write_str("run"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecCommand {
    pub phase: Phase,
    pub argv: Vec<String>,
    pub working_dir: String,
    /// Per-stream capture ceiling
    pub output_limit: usize,
}

impl ExecCommand {
    /// Run `script` through `sh -c` in the workspace.
    pub fn shell(phase: Phase, script: String, output_limit: usize) -> Self {
        Self {
            phase,
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            working_dir: WORKSPACE_DIR.to_string(),
            output_limit,
        }
    }

    pub fn script(&self) -> &str {
        self.argv.last().map(String::as_str).unwrap_or_default()
    }
}

/// Capture target for one exec.
///
/// Owned by the caller, so whatever was streamed before an exec is
/// interrupted (timeout, cancellation) is still readable afterwards.
#[derive(Debug)]
pub struct OutputSink {
    stdout: Mutex<OutputBuffer>,
    stderr: Mutex<OutputBuffer>,
}

fn lock(buffer: &Mutex<OutputBuffer>) -> MutexGuard<'_, OutputBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OutputSink {
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: Mutex::new(OutputBuffer::new(limit)),
            stderr: Mutex::new(OutputBuffer::new(limit)),
        }
    }

    pub fn push_stdout(&self, chunk: &[u8]) {
        lock(&self.stdout).push(chunk);
    }

    pub fn push_stderr(&self, chunk: &[u8]) {
        lock(&self.stderr).push(chunk);
    }

    /// Copy of what has been captured so far, as (stdout, stderr)
    pub fn snapshot(&self) -> (OutputBuffer, OutputBuffer) {
        (lock(&self.stdout).clone(), lock(&self.stderr).clone())
    }
}

/// Resource accounting for one exec, when the substrate can measure it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecUsage {
    /// CPU time consumed in the sandbox while the exec ran
    pub cpu_time_ms: Option<u64>,
    /// High-water mark of sandbox memory, including earlier phases
    pub memory_peak_bytes: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatus {
    /// `None` when the substrate could not observe an exit status
    pub exit_code: Option<i64>,
    /// The substrate confirmed that a memory, CPU-time or file-size ceiling
    /// ended the process. An exit status alone never sets this.
    pub resource_exceeded: bool,
    pub usage: ExecUsage,
}

impl ExecStatus {
    pub fn exited(code: i64) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    /// The process was never started; running the command again is safe
    #[error("exec did not start: {0:#}")]
    NotStarted(anyhow::Error),

    /// The process started but its outcome was lost
    #[error("exec interrupted after start: {0:#}")]
    Interrupted(anyhow::Error),
}

impl ExecError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::NotStarted(_))
    }
}

#[async_trait]
pub trait IsolationSubstrate: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Create and start an environment. A partially created environment
    /// must be removed before an error is returned.
    async fn create_environment(&self, spec: &EnvironmentSpec) -> anyhow::Result<EnvironmentId>;

    /// Run one command to completion inside the environment, streaming its
    /// output into `output` as it arrives.
    ///
    /// Failures before the process exists are [`ExecError::NotStarted`];
    /// anything after that is [`ExecError::Interrupted`].
    async fn exec_in(
        &self,
        env: &EnvironmentId,
        command: &ExecCommand,
        output: &OutputSink,
    ) -> Result<ExecStatus, ExecError>;

    /// Forcibly stop every process in the environment.
    async fn kill(&self, env: &EnvironmentId) -> anyhow::Result<()>;

    /// Remove the environment and reclaim its resources.
    async fn destroy_environment(&self, env: &EnvironmentId) -> anyhow::Result<()>;
}
