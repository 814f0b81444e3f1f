/// Orchestrator - composes the pipeline for each submission
///
/// **Lifecycle:** `Received → Staged → Provisioned → Running → Finalized`
///
/// Every path ends in `Finalized` with exactly one result, and every
/// directory and sandbox acquired on the way is released exactly once.
/// Cancellation skips the remaining states and finalizes as `Cancelled`.
///
/// A fair semaphore bounds how many submissions hold a sandbox at once.
/// Excess submissions wait in arrival order.
///
/// No state can stall a submission forever. Staging and provisioning are
/// bounded by `setup_timeout` and yield to cancellation; running is bounded
/// by the timeout plus `grace`. A setup step that is given up on keeps
/// running in the background, and whatever it eventually produces is
/// released.
use crate::collector::ResultCollector;
use crate::error::EngineError;
use crate::materializer::{SubmissionMaterializer, WorkingDir};
use crate::provisioner::{SandboxHandle, SandboxProvisioner};
use crate::registry::{LanguageProfile, LanguageRegistry};
use crate::retry::retry_once;
use crate::runner::{ExecutionRunner, RawExecutionOutcome};
use crate::substrate::Phase;
use arbiter_common::config::ServiceConfig;
use arbiter_common::types::{ExecutionResult, Submission};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const MAX_SOURCE_BYTES: usize = 1024 * 1024;
pub const MAX_STDIN_BYTES: usize = 10 * 1024 * 1024;

/// Service-wide execution policy
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub max_concurrency: usize,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    /// Fraction of the timeout the compile phase may use
    pub compile_share: f64,
    /// Slack on top of the timeout before the pipeline is torn down regardless
    pub grace: Duration,
    /// Ceiling for staging and, separately, for provisioning (image pulls included)
    pub setup_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(30),
            compile_share: 0.5,
            grace: Duration::from_secs(1),
            setup_timeout: Duration::from_secs(60),
            retry_backoff: Duration::from_millis(200),
            max_source_bytes: MAX_SOURCE_BYTES,
            max_stdin_bytes: MAX_STDIN_BYTES,
        }
    }
}

impl ExecutionPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            default_timeout: config.default_timeout,
            max_timeout: config.max_timeout,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.default_timeout.is_zero() || self.default_timeout > self.max_timeout {
            return Err(EngineError::Config(
                "default_timeout must be positive and no larger than max_timeout".to_string(),
            ));
        }
        if self.setup_timeout.is_zero() {
            return Err(EngineError::Config("setup_timeout must be positive".to_string()));
        }
        if !(self.compile_share > 0.0 && self.compile_share < 1.0) {
            return Err(EngineError::Config("compile_share must be between 0 and 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubmissionState {
    Received,
    Staged,
    Provisioned,
    Running,
    Finalized,
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionState::Received => "received",
            SubmissionState::Staged => "staged",
            SubmissionState::Provisioned => "provisioned",
            SubmissionState::Running => "running",
            SubmissionState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Forward-only state tracker for one submission
#[derive(Debug)]
struct Lifecycle {
    submission_id: Uuid,
    state: SubmissionState,
}

impl Lifecycle {
    fn new(submission_id: Uuid) -> Self {
        Self {
            submission_id,
            state: SubmissionState::Received,
        }
    }

    fn advance(&mut self, next: SubmissionState) {
        if next <= self.state {
            warn!(submission_id = %self.submission_id, from = %self.state, to = %next, "Ignoring backward state transition");
            return;
        }
        debug!(submission_id = %self.submission_id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }
}

/// Why a setup step was given up on
#[derive(Debug, Clone, Copy)]
enum Interruption {
    Cancelled,
    TimedOut,
}

enum Setup<T> {
    Ready(T),
    Failed(String),
    Interrupted(Interruption),
}

impl Interruption {
    fn outcome(self, step: &str, limit: Duration, elapsed: Duration) -> RawExecutionOutcome {
        match self {
            Interruption::Cancelled => RawExecutionOutcome::cancelled(Phase::Compile, elapsed),
            Interruption::TimedOut => RawExecutionOutcome::internal(
                Phase::Compile,
                elapsed,
                format!("{} exceeded {}ms", step, limit.as_millis()),
            ),
        }
    }
}

/// Wait for a spawned setup step, giving up on cancellation or after `limit`.
async fn await_setup<T>(
    task: &mut JoinHandle<Result<T, EngineError>>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Setup<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Setup::Interrupted(Interruption::Cancelled),
        joined = task => match joined {
            Ok(Ok(value)) => Setup::Ready(value),
            Ok(Err(e)) => Setup::Failed(e.to_string()),
            Err(e) => Setup::Failed(format!("setup task failed: {}", e)),
        },
        _ = tokio::time::sleep(limit) => Setup::Interrupted(Interruption::TimedOut),
    }
}

struct Inner {
    registry: Arc<LanguageRegistry>,
    materializer: SubmissionMaterializer,
    provisioner: SandboxProvisioner,
    runner: ExecutionRunner,
    policy: ExecutionPolicy,
    slots: Semaphore,
}

/// Cheap to clone; clones share the registry and the concurrency ceiling.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        materializer: SubmissionMaterializer,
        provisioner: SandboxProvisioner,
        policy: ExecutionPolicy,
    ) -> Result<Self, EngineError> {
        policy.validate()?;
        let runner = ExecutionRunner::new(policy.compile_share, policy.retry_backoff);
        let slots = Semaphore::new(policy.max_concurrency);

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                materializer,
                provisioner,
                runner,
                policy,
                slots,
            }),
        })
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.inner.registry
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.inner.policy
    }

    /// Submissions currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.inner.policy.max_concurrency - self.inner.slots.available_permits()
    }

    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Reject caller mistakes before anything is staged.
    pub fn validate<'a>(&'a self, submission: &Submission) -> Result<&'a LanguageProfile, EngineError> {
        let policy = &self.inner.policy;
        let profile = self.inner.registry.resolve(&submission.language)?;

        if submission.source.is_empty() {
            return Err(EngineError::InvalidSubmission("source code is empty".to_string()));
        }
        if submission.source.len() > policy.max_source_bytes {
            return Err(EngineError::TooLarge {
                field: "source_code",
                limit: policy.max_source_bytes,
            });
        }
        if let Some(stdin) = &submission.stdin {
            if stdin.len() > policy.max_stdin_bytes {
                return Err(EngineError::TooLarge {
                    field: "stdin",
                    limit: policy.max_stdin_bytes,
                });
            }
        }
        if submission.timeout == Some(Duration::ZERO) {
            return Err(EngineError::InvalidSubmission("timeout must be positive".to_string()));
        }
        Ok(profile)
    }

    /// Requested timeout clamped to `[1ms, max_timeout]`.
    ///
    /// Without a request, the smaller of the service default and the
    /// language's own wall-clock limit applies.
    pub fn effective_timeout(&self, submission: &Submission, profile: &LanguageProfile) -> Duration {
        let policy = &self.inner.policy;
        let requested = submission
            .timeout
            .unwrap_or_else(|| policy.default_timeout.min(profile.limits.wall_clock()));
        requested.clamp(Duration::from_millis(1), policy.max_timeout)
    }

    /// Run one submission to completion on the caller's task.
    ///
    /// Only caller errors are returned as `Err`; every other outcome,
    /// including infrastructure failure, is a result.
    #[instrument(skip(self, submission, cancel), fields(submission_id = %submission.id, language = %submission.language))]
    pub async fn execute(
        &self,
        submission: Submission,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        let profile = match self.validate(&submission) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Submission rejected");
                return Err(e);
            }
        };
        let timeout = self.effective_timeout(&submission, profile);
        let started = Instant::now();

        info!(
            timeout_ms = timeout.as_millis() as u64,
            source_bytes = submission.source.len(),
            has_stdin = submission.stdin.is_some(),
            "Submission received"
        );

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Cancelled while waiting for a slot");
                let raw = RawExecutionOutcome::cancelled(Phase::Compile, started.elapsed());
                return Ok(self.collector().collect(&profile.id, raw, None, None, submission.id).await);
            }
            permit = self.inner.slots.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let raw = RawExecutionOutcome::internal(Phase::Compile, started.elapsed(), "execution slots closed");
                    return Ok(self.collector().collect(&profile.id, raw, None, None, submission.id).await);
                }
            },
        };

        let queued_ms = started.elapsed().as_millis() as u64;
        debug!(queued_ms, in_flight = self.in_flight(), "Slot acquired");

        let result = self.pipeline(&submission, profile, timeout, &cancel, started).await;

        info!(
            verdict = %result.verdict,
            exit_code = ?result.exit_code,
            elapsed_ms = result.elapsed_ms,
            stdout_truncated = result.stdout_truncated,
            stderr_truncated = result.stderr_truncated,
            "Submission finalized"
        );
        Ok(result)
    }

    fn collector(&self) -> ResultCollector<'_> {
        ResultCollector::new(&self.inner.provisioner, &self.inner.materializer)
    }

    async fn pipeline(
        &self,
        submission: &Submission,
        profile: &LanguageProfile,
        timeout: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> ExecutionResult {
        let inner = &self.inner;
        let collector = self.collector();
        let setup_timeout = inner.policy.setup_timeout;
        let mut lifecycle = Lifecycle::new(submission.id);

        if cancel.is_cancelled() {
            lifecycle.advance(SubmissionState::Finalized);
            let raw = RawExecutionOutcome::cancelled(Phase::Compile, started.elapsed());
            return collector.collect(&profile.id, raw, None, None, submission.id).await;
        }

        let mut staging = self.spawn_staging(submission, profile);
        let workdir = match await_setup(&mut staging, setup_timeout, cancel).await {
            Setup::Ready(dir) => dir,
            Setup::Failed(reason) => {
                error!(error = %reason, "Staging failed");
                lifecycle.advance(SubmissionState::Finalized);
                let raw = RawExecutionOutcome::internal(Phase::Compile, started.elapsed(), reason);
                return collector.collect(&profile.id, raw, None, None, submission.id).await;
            }
            Setup::Interrupted(why) => {
                warn!(reason = ?why, "Giving up on staging");
                self.abandon_staging(staging);
                lifecycle.advance(SubmissionState::Finalized);
                let raw = why.outcome("staging", setup_timeout, started.elapsed());
                return collector.collect(&profile.id, raw, None, None, submission.id).await;
            }
        };
        lifecycle.advance(SubmissionState::Staged);

        if cancel.is_cancelled() {
            lifecycle.advance(SubmissionState::Finalized);
            let raw = RawExecutionOutcome::cancelled(Phase::Compile, started.elapsed());
            return collector.collect(&profile.id, raw, None, Some(&workdir), submission.id).await;
        }

        let mut provisioning = self.spawn_provisioning(submission.id, profile, &workdir);
        let sandbox = match await_setup(&mut provisioning, setup_timeout, cancel).await {
            Setup::Ready(handle) => handle,
            Setup::Failed(reason) => {
                error!(error = %reason, "Provisioning failed");
                lifecycle.advance(SubmissionState::Finalized);
                let raw = RawExecutionOutcome::internal(Phase::Compile, started.elapsed(), reason);
                return collector.collect(&profile.id, raw, None, Some(&workdir), submission.id).await;
            }
            Setup::Interrupted(why) => {
                warn!(reason = ?why, "Giving up on provisioning");
                self.abandon_provisioning(provisioning, workdir.clone());
                lifecycle.advance(SubmissionState::Finalized);
                let raw = why.outcome("provisioning", setup_timeout, started.elapsed());
                return collector.collect(&profile.id, raw, None, Some(&workdir), submission.id).await;
            }
        };
        lifecycle.advance(SubmissionState::Provisioned);

        if cancel.is_cancelled() {
            lifecycle.advance(SubmissionState::Finalized);
            let raw = RawExecutionOutcome::cancelled(Phase::Compile, started.elapsed());
            return collector
                .collect(&profile.id, raw, Some(sandbox), Some(&workdir), submission.id)
                .await;
        }

        lifecycle.advance(SubmissionState::Running);
        let ceiling = timeout + inner.policy.grace;
        let run = inner.runner.run(&sandbox, &workdir, profile, timeout, cancel);
        let raw = match tokio::time::timeout(ceiling, run).await {
            Ok(raw) => raw,
            Err(_) => {
                error!(ceiling_ms = ceiling.as_millis() as u64, "Submission exceeded its hard ceiling");
                sandbox.terminate().await;
                RawExecutionOutcome::timed_out(Phase::Run, started.elapsed(), timeout)
            }
        };

        lifecycle.advance(SubmissionState::Finalized);
        collector
            .collect(&profile.id, raw, Some(sandbox), Some(&workdir), submission.id)
            .await
    }

    fn spawn_staging(
        &self,
        submission: &Submission,
        profile: &LanguageProfile,
    ) -> JoinHandle<Result<WorkingDir, EngineError>> {
        let inner = Arc::clone(&self.inner);
        let submission = submission.clone();
        let profile = profile.clone();
        tokio::spawn(async move {
            let materializer = &inner.materializer;
            retry_once("stage submission", inner.policy.retry_backoff, || {
                materializer.stage(&submission, &profile)
            })
            .await
        })
    }

    fn spawn_provisioning(
        &self,
        submission_id: Uuid,
        profile: &LanguageProfile,
        workdir: &WorkingDir,
    ) -> JoinHandle<Result<SandboxHandle, EngineError>> {
        let inner = Arc::clone(&self.inner);
        let profile = profile.clone();
        let path = workdir.path.clone();
        tokio::spawn(async move {
            let provisioner = &inner.provisioner;
            retry_once("provision sandbox", inner.policy.retry_backoff, || {
                provisioner.acquire(&profile, submission_id, &path)
            })
            .await
        })
    }

    /// Let an abandoned staging step finish, then remove what it wrote.
    fn abandon_staging(&self, task: JoinHandle<Result<WorkingDir, EngineError>>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Ok(Ok(dir)) = task.await {
                if let Err(e) = inner.materializer.cleanup(&dir).await {
                    warn!(path = %dir.path.display(), error = %e, "Failed to clean up abandoned staging");
                }
            }
        });
    }

    /// Let an abandoned provisioning step finish, then release its sandbox.
    ///
    /// The working directory is removed again afterwards: a late container
    /// create may have recreated its bind source.
    fn abandon_provisioning(&self, task: JoinHandle<Result<SandboxHandle, EngineError>>, workdir: WorkingDir) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Ok(Ok(handle)) = task.await {
                debug!(submission_id = %handle.submission_id(), "Releasing sandbox provisioned after its submission gave up");
                inner.provisioner.release(handle).await;
                if let Err(e) = inner.materializer.cleanup(&workdir).await {
                    warn!(path = %workdir.path.display(), error = %e, "Failed to clean up after abandoned provisioning");
                }
            }
        });
    }

    /// Run a submission on its own task.
    ///
    /// Caller errors are detected up front and never spawn anything.
    pub fn submit(&self, submission: Submission) -> Result<SubmissionTicket, EngineError> {
        self.validate(&submission)?;

        let id = submission.id;
        let language = submission.language.clone();
        let cancel = CancellationToken::new();
        let orchestrator = self.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { orchestrator.execute(submission, task_cancel).await });

        Ok(SubmissionTicket {
            id,
            language,
            cancel,
            task,
        })
    }
}

/// Handle to a submission running on its own task
pub struct SubmissionTicket {
    id: Uuid,
    language: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<ExecutionResult, EngineError>>,
}

impl SubmissionTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A guard that cancels the submission when dropped, e.g. when the
    /// request that owns it goes away.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Wait for the final result.
    pub async fn wait(self) -> Result<ExecutionResult, EngineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(submission_id = %self.id, error = %e, "Submission task failed");
                Ok(crate::collector::finalize(
                    self.id,
                    &self.language,
                    RawExecutionOutcome::internal(Phase::Run, Duration::ZERO, format!("submission task failed: {}", e)),
                ))
            }
        }
    }
}
