/// Execution Runner - compile and run inside an acquired sandbox
///
/// **Algorithm:**
/// 1. Compile (if the profile has a compile command) under `compile_share`
///    of the total budget. Non-zero exit is a compile failure.
/// 2. Run under whatever budget remains, stdin redirected from the staged
///    file. Overrunning the budget kills the sandbox.
/// 3. Output is capped per stream while it streams in. A run that is
///    killed for overrunning keeps whatever it printed before the kill.
///
/// An exec that the substrate failed to start is retried once. Once the
/// process has started it is never run again: a lost stream or exit status
/// kills the sandbox and ends the submission as an internal error. A
/// program's own failures (compile error, crash, timeout, resource limit)
/// are never retried.
///
/// The runner never releases the sandbox; that belongs to the collector.
use crate::materializer::WorkingDir;
use crate::output::OutputBuffer;
use crate::provisioner::SandboxHandle;
use crate::registry::LanguageProfile;
use crate::retry::retry_once_if;
use crate::substrate::{
    ExecCommand, ExecError, ExecStatus, ExecUsage, OutputSink, Phase, SUBMISSION_DIR, WORKSPACE_DIR,
};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The run phase finished on its own; the exit code decides success
    Exited,
    CompileFailed,
    TimedOut,
    ResourceExceeded,
    Cancelled,
    /// The sandbox could not execute the phase at all
    Internal,
}

/// What happened inside the sandbox, before verdict formatting
#[derive(Debug, Clone)]
pub struct RawExecutionOutcome {
    pub kind: OutcomeKind,
    pub phase: Phase,
    pub exit_code: Option<i64>,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    pub elapsed: Duration,
    pub detail: Option<String>,
    /// Accounting for the last phase that ran to completion
    pub usage: ExecUsage,
}

impl RawExecutionOutcome {
    fn empty(kind: OutcomeKind, phase: Phase, elapsed: Duration, detail: Option<String>) -> Self {
        Self {
            kind,
            phase,
            exit_code: None,
            stdout: OutputBuffer::new(0),
            stderr: OutputBuffer::new(0),
            elapsed,
            detail,
            usage: ExecUsage::default(),
        }
    }

    fn captured(kind: OutcomeKind, phase: Phase, exit_code: Option<i64>, output: Captured, elapsed: Duration) -> Self {
        Self {
            kind,
            phase,
            exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
            detail: None,
            usage: ExecUsage::default(),
        }
    }

    fn with_usage(mut self, usage: ExecUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn internal(phase: Phase, elapsed: Duration, detail: impl Into<String>) -> Self {
        Self::empty(OutcomeKind::Internal, phase, elapsed, Some(detail.into()))
    }

    pub fn cancelled(phase: Phase, elapsed: Duration) -> Self {
        Self::empty(
            OutcomeKind::Cancelled,
            phase,
            elapsed,
            Some("submission cancelled".to_string()),
        )
    }

    pub fn timed_out(phase: Phase, elapsed: Duration, budget: Duration) -> Self {
        Self::empty(
            OutcomeKind::TimedOut,
            phase,
            elapsed,
            Some(format!("execution exceeded {}ms", budget.as_millis())),
        )
    }
}

struct Captured {
    stdout: OutputBuffer,
    stderr: OutputBuffer,
}

impl Captured {
    fn from_sink(sink: &OutputSink) -> Self {
        let (stdout, stderr) = sink.snapshot();
        Self { stdout, stderr }
    }
}

/// How a single phase ended
enum PhaseEnd {
    Finished(ExecStatus, Captured),
    TimedOut(Captured),
    Cancelled,
    Failed(ExecError),
}

/// Expand `{source}`, `{workspace}` and `{submission}` in a command template.
pub fn render_command(template: &str, dir: &WorkingDir) -> String {
    template
        .replace("{source}", &dir.sandbox_source())
        .replace("{workspace}", WORKSPACE_DIR)
        .replace("{submission}", SUBMISSION_DIR)
}

#[derive(Debug, Clone)]
pub struct ExecutionRunner {
    compile_share: f64,
    retry_backoff: Duration,
}

impl ExecutionRunner {
    pub fn new(compile_share: f64, retry_backoff: Duration) -> Self {
        Self {
            compile_share: compile_share.clamp(0.05, 0.95),
            retry_backoff,
        }
    }

    pub fn compile_budget(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.compile_share)
    }

    async fn run_phase(
        &self,
        handle: &SandboxHandle,
        command: &ExecCommand,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> PhaseEnd {
        let deadline = Instant::now() + budget;

        // Fresh sink per attempt: output from a failed attempt is discarded
        let attempt = retry_once_if("sandbox exec", self.retry_backoff, ExecError::is_retryable, || async move {
            let sink = OutputSink::new(command.output_limit);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Ok(PhaseEnd::Cancelled),
                result = tokio::time::timeout_at(deadline, handle.exec(command, &sink)) => match result {
                    Ok(Ok(status)) => Ok(PhaseEnd::Finished(status, Captured::from_sink(&sink))),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Ok(PhaseEnd::TimedOut(Captured::from_sink(&sink))),
                },
            }
        })
        .await;

        let end = attempt.unwrap_or_else(PhaseEnd::Failed);
        if matches!(
            end,
            PhaseEnd::TimedOut(_) | PhaseEnd::Cancelled | PhaseEnd::Failed(ExecError::Interrupted(_))
        ) {
            // The exec is gone but the process may still be running
            handle.terminate().await;
        }
        end
    }

    #[instrument(
        skip(self, handle, dir, profile, cancel),
        fields(submission_id = %handle.submission_id(), language = %profile.id, timeout_ms = timeout.as_millis() as u64)
    )]
    pub async fn run(
        &self,
        handle: &SandboxHandle,
        dir: &WorkingDir,
        profile: &LanguageProfile,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> RawExecutionOutcome {
        let started = Instant::now();
        let output_limit = profile.limits.max_output_bytes;

        if let Some(template) = &profile.compile_command {
            let budget = self.compile_budget(timeout);
            let command = ExecCommand::shell(Phase::Compile, render_command(template, dir), output_limit);

            match self.run_phase(handle, &command, budget, cancel).await {
                PhaseEnd::Finished(status, _) if status.exit_code == Some(0) => {
                    debug!(compile_ms = started.elapsed().as_millis() as u64, "Compilation succeeded");
                }
                PhaseEnd::Finished(status, _) if status.exit_code.is_none() => {
                    return RawExecutionOutcome::internal(
                        Phase::Compile,
                        started.elapsed(),
                        "compiler exit status unavailable",
                    );
                }
                PhaseEnd::Finished(status, output) => {
                    warn!(
                        exit_code = ?status.exit_code,
                        error_preview = %output.stderr.to_string_lossy().lines().next().unwrap_or(""),
                        "Compilation failed"
                    );
                    let mut outcome = RawExecutionOutcome::captured(
                        OutcomeKind::CompileFailed,
                        Phase::Compile,
                        status.exit_code,
                        output,
                        started.elapsed(),
                    )
                    .with_usage(status.usage);
                    if status.resource_exceeded {
                        outcome.detail = Some("compiler exceeded a resource limit".to_string());
                    }
                    return outcome;
                }
                PhaseEnd::TimedOut(mut output) => {
                    warn!(budget_ms = budget.as_millis() as u64, "Compilation timed out");
                    if !output.stderr.is_empty() {
                        output.stderr.push(b"\n");
                    }
                    output
                        .stderr
                        .push(format!("compilation exceeded {}ms", budget.as_millis()).as_bytes());
                    let mut outcome = RawExecutionOutcome::captured(
                        OutcomeKind::CompileFailed,
                        Phase::Compile,
                        None,
                        output,
                        started.elapsed(),
                    );
                    outcome.detail = Some("compile phase timed out".to_string());
                    return outcome;
                }
                PhaseEnd::Cancelled => {
                    return RawExecutionOutcome::cancelled(Phase::Compile, started.elapsed());
                }
                PhaseEnd::Failed(e) => {
                    warn!(error = %e, "Sandbox failed to run the compiler");
                    return RawExecutionOutcome::internal(Phase::Compile, started.elapsed(), e.to_string());
                }
            }
        }

        let budget = timeout.saturating_sub(started.elapsed());
        if budget.is_zero() {
            return RawExecutionOutcome::timed_out(Phase::Run, started.elapsed(), timeout);
        }

        let script = format!(
            "exec {} < {}",
            render_command(&profile.run_command, dir),
            dir.sandbox_stdin()
        );
        let command = ExecCommand::shell(Phase::Run, script, output_limit);

        match self.run_phase(handle, &command, budget, cancel).await {
            PhaseEnd::Finished(status, output) => {
                let elapsed = started.elapsed();
                let kind = if status.resource_exceeded {
                    OutcomeKind::ResourceExceeded
                } else if status.exit_code.is_some() {
                    OutcomeKind::Exited
                } else {
                    return RawExecutionOutcome::internal(Phase::Run, elapsed, "program exit status unavailable");
                };
                debug!(exit_code = ?status.exit_code, kind = ?kind, elapsed_ms = elapsed.as_millis() as u64, "Run finished");
                RawExecutionOutcome::captured(kind, Phase::Run, status.exit_code, output, elapsed).with_usage(status.usage)
            }
            PhaseEnd::TimedOut(output) => {
                warn!(budget_ms = budget.as_millis() as u64, "Execution timed out, sandbox killed");
                let mut outcome =
                    RawExecutionOutcome::captured(OutcomeKind::TimedOut, Phase::Run, None, output, started.elapsed());
                outcome.detail = Some(format!("execution exceeded {}ms", timeout.as_millis()));
                outcome
            }
            PhaseEnd::Cancelled => RawExecutionOutcome::cancelled(Phase::Run, started.elapsed()),
            PhaseEnd::Failed(e) => {
                warn!(error = %e, "Sandbox failed to run the program");
                RawExecutionOutcome::internal(Phase::Run, started.elapsed(), e.to_string())
            }
        }
    }
}
