// Result collection: raw outcome -> verdict, then sandbox release and workspace cleanup

use crate::materializer::{SubmissionMaterializer, WorkingDir};
use crate::provisioner::{SandboxHandle, SandboxProvisioner};
use crate::runner::{OutcomeKind, RawExecutionOutcome};
use arbiter_common::types::{ExecutionResult, Verdict};
use tracing::{debug, warn};
use uuid::Uuid;

pub fn verdict_for(raw: &RawExecutionOutcome) -> Verdict {
    match raw.kind {
        OutcomeKind::Exited if raw.exit_code == Some(0) => Verdict::Success,
        OutcomeKind::Exited => Verdict::RuntimeError,
        OutcomeKind::CompileFailed => Verdict::CompileError,
        OutcomeKind::TimedOut => Verdict::Timeout,
        OutcomeKind::ResourceExceeded => Verdict::ResourceExceeded,
        OutcomeKind::Cancelled => Verdict::Cancelled,
        OutcomeKind::Internal => Verdict::InternalError,
    }
}

/// Format a raw outcome as the caller-facing result. Pure.
///
/// An internal error never carries program output, partial or otherwise.
pub fn finalize(submission_id: Uuid, language: &str, raw: RawExecutionOutcome) -> ExecutionResult {
    let verdict = verdict_for(&raw);
    let elapsed_ms = raw.elapsed.as_millis() as u64;

    if verdict == Verdict::InternalError {
        return ExecutionResult {
            submission_id,
            language: language.to_string(),
            verdict,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            elapsed_ms,
            cpu_time_ms: None,
            memory_peak_bytes: None,
            detail: raw.detail,
        };
    }

    ExecutionResult {
        submission_id,
        language: language.to_string(),
        verdict,
        stdout: raw.stdout.to_string_lossy(),
        stderr: raw.stderr.to_string_lossy(),
        stdout_truncated: raw.stdout.is_truncated(),
        stderr_truncated: raw.stderr.is_truncated(),
        exit_code: raw.exit_code,
        elapsed_ms,
        cpu_time_ms: raw.usage.cpu_time_ms,
        memory_peak_bytes: raw.usage.memory_peak_bytes,
        detail: raw.detail,
    }
}

pub struct ResultCollector<'a> {
    provisioner: &'a SandboxProvisioner,
    materializer: &'a SubmissionMaterializer,
}

impl<'a> ResultCollector<'a> {
    pub fn new(provisioner: &'a SandboxProvisioner, materializer: &'a SubmissionMaterializer) -> Self {
        Self {
            provisioner,
            materializer,
        }
    }

    /// Release the sandbox, remove the staged directory, then finalize.
    ///
    /// Cleanup failures are logged and never change the verdict.
    pub async fn collect(
        &self,
        language: &str,
        raw: RawExecutionOutcome,
        sandbox: Option<SandboxHandle>,
        workdir: Option<&WorkingDir>,
        submission_id: Uuid,
    ) -> ExecutionResult {
        if let Some(handle) = sandbox {
            self.provisioner.release(handle).await;
        }
        if let Some(dir) = workdir {
            if let Err(e) = self.materializer.cleanup(dir).await {
                warn!(submission_id = %submission_id, path = %dir.path.display(), error = %e, "Failed to remove submission directory");
            }
        }

        let result = finalize(submission_id, language, raw);
        debug!(
            submission_id = %submission_id,
            verdict = %result.verdict,
            stdout_bytes = result.stdout.len(),
            stderr_bytes = result.stderr.len(),
            "Result collected"
        );
        result
    }
}
