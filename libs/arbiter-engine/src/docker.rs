/// Docker Substrate - container-backed sandboxes via Bollard
///
/// **Sandbox layout (one container per submission):**
/// - Main process is `sleep infinity`; compile and run are `docker exec`s
/// - Staged submission bind-mounted read-only at `/submission`
/// - Size-bounded tmpfs at `/workspace` (build output) and `/tmp`
/// - Read-only root filesystem, no network, all capabilities dropped,
///   `no-new-privileges`, non-root user
/// - memory, swap, CPU share, pids, RLIMIT_CPU and RLIMIT_FSIZE ceilings
///
/// Every container carries the `arbiter.managed` label so orphans left by a
/// crash can be reaped at startup.
///
/// **Resource verdicts:** an exit status of 137, 152 or 153 is only a hint.
/// After such an exit the sandbox's cgroup v2 counters (`memory.events`,
/// `cpu.stat`) are compared with the previous reading, and a file-size kill
/// is confirmed by looking for a file that reached RLIMIT_FSIZE. A program
/// that merely exits with one of those codes is a runtime error.
use crate::registry::ResourceLimits;
use crate::substrate::{
    EnvironmentId, EnvironmentSpec, ExecCommand, ExecError, ExecStatus, ExecUsage, IsolationSubstrate, OutputSink,
    LABEL_MANAGED, SUBMISSION_DIR, WORKSPACE_DIR,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, ListContainersOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

/// SIGKILL from the OOM killer or the RLIMIT_CPU hard limit
const EXIT_SIGKILL: i64 = 128 + 9;
/// RLIMIT_CPU soft limit
const EXIT_SIGXCPU: i64 = 128 + 24;
/// RLIMIT_FSIZE
const EXIT_SIGXFSZ: i64 = 128 + 25;

/// Reads the sandbox's own cgroup (private cgroup namespace)
const CGROUP_STATS_SCRIPT: &str = "cd /sys/fs/cgroup 2>/dev/null || exit 1; \
cat memory.events cpu.stat 2>/dev/null; \
echo \"memory_peak $(cat memory.peak 2>/dev/null)\"; \
echo \"pids_peak $(cat pids.peak 2>/dev/null)\"";

/// cgroup v2 counters of one sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupStats {
    pub oom_kills: u64,
    pub cpu_usage_usec: u64,
    pub memory_peak: Option<u64>,
    pub pids_peak: Option<u64>,
}

impl CgroupStats {
    /// Parse the `key value` lines printed by the stats script.
    ///
    /// `None` when `cpu.stat` was unreadable (cgroup v1 hosts).
    pub fn parse(text: &str) -> Option<Self> {
        let mut stats = Self::default();
        let mut cpu_seen = false;
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else { continue };
            match key {
                "oom_kill" => stats.oom_kills = value,
                "usage_usec" => {
                    stats.cpu_usage_usec = value;
                    cpu_seen = true;
                }
                "memory_peak" => stats.memory_peak = Some(value),
                "pids_peak" => stats.pids_peak = Some(value),
                _ => {}
            }
        }
        cpu_seen.then_some(stats)
    }

    pub fn since(&self, earlier: &CgroupStats) -> UsageDelta {
        UsageDelta {
            cpu_time_ms: self.cpu_usage_usec.saturating_sub(earlier.cpu_usage_usec) / 1000,
            oom_kills: self.oom_kills.saturating_sub(earlier.oom_kills),
        }
    }
}

/// What one exec consumed, from two cgroup readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageDelta {
    pub cpu_time_ms: u64,
    pub oom_kills: u64,
}

impl UsageDelta {
    /// Whether the kernel, not the program, produced `exit_code`.
    pub fn confirms_limit(&self, exit_code: i64, limits: &ResourceLimits) -> bool {
        let cpu_exhausted = self.cpu_time_ms >= limits.cpu_time_secs * 1000;
        match exit_code {
            EXIT_SIGKILL => self.oom_kills > 0 || cpu_exhausted,
            EXIT_SIGXCPU => cpu_exhausted,
            _ => false,
        }
    }
}

/// Per-container bookkeeping for resource accounting
#[derive(Debug, Clone)]
struct SandboxState {
    limits: ResourceLimits,
    /// Counters as of the end of the previous exec
    baseline: CgroupStats,
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code: 404, .. }
    )
}

fn is_not_running(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code: 409, .. }
    )
}

/// Host configuration carrying every isolation and resource setting
pub fn host_config(spec: &EnvironmentSpec) -> HostConfig {
    let limits: &ResourceLimits = &spec.limits;
    let cpu_secs = limits.cpu_time_secs as i64;
    let fsize = limits.disk_bytes();

    let tmpfs = HashMap::from([
        (
            WORKSPACE_DIR.to_string(),
            format!("rw,exec,nosuid,nodev,size={}m,mode=1777", limits.disk_mb),
        ),
        (
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,nodev,size={}m,mode=1777", limits.disk_mb),
        ),
    ]);

    HostConfig {
        memory: Some(limits.memory_bytes()),
        memory_swap: Some(limits.memory_swap_bytes()),
        nano_cpus: Some(limits.nano_cpus()),
        pids_limit: Some(limits.pids_limit),
        ulimits: Some(vec![
            ResourcesUlimits {
                name: Some("cpu".to_string()),
                soft: Some(cpu_secs),
                hard: Some(cpu_secs + 1),
            },
            ResourcesUlimits {
                name: Some("fsize".to_string()),
                soft: Some(fsize),
                hard: Some(fsize),
            },
            ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(256),
                hard: Some(256),
            },
        ]),
        network_mode: Some(if spec.network_disabled { "none" } else { "bridge" }.to_string()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        binds: Some(vec![format!(
            "{}:{}:ro",
            spec.submission_source.display(),
            SUBMISSION_DIR
        )]),
        tmpfs: Some(tmpfs),
        ..Default::default()
    }
}

pub struct DockerSubstrate {
    docker: Docker,
    sandboxes: Mutex<HashMap<String, SandboxState>>,
}

impl DockerSubstrate {
    /// Connect using DOCKER_HOST or the local socket
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    fn sandboxes(&self) -> MutexGuard<'_, HashMap<String, SandboxState>> {
        self.sandboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        Ok(())
    }

    /// Ensure Docker image is available (pull if needed)
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    /// Run a short bookkeeping command in the sandbox and collect its stdout.
    async fn capture(&self, env: &EnvironmentId, script: &str) -> Result<String> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]),
            attach_stdout: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(&env.0, exec_config)
            .await
            .context("Failed to create bookkeeping exec")?;

        let mut text = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context("Failed to start bookkeeping exec")?
        {
            while let Some(msg) = output.next().await {
                if let LogOutput::StdOut { message } = msg.context("Failed to read bookkeeping output")? {
                    text.push_str(&String::from_utf8_lossy(&message));
                }
            }
        }
        Ok(text)
    }

    async fn cgroup_stats(&self, env: &EnvironmentId) -> Option<CgroupStats> {
        match self.capture(env, CGROUP_STATS_SCRIPT).await {
            Ok(text) => CgroupStats::parse(&text),
            Err(e) => {
                debug!(container_id = %env, error = %e, "cgroup stats unavailable");
                None
            }
        }
    }

    /// Whether some file in the writable mounts reached RLIMIT_FSIZE
    async fn file_limit_reached(&self, env: &EnvironmentId, limits: &ResourceLimits) -> bool {
        let script = format!(
            "find {} /tmp -xdev -type f -size +{}c 2>/dev/null | head -n 1",
            WORKSPACE_DIR,
            limits.disk_bytes() - 1
        );
        match self.capture(env, &script).await {
            Ok(found) => !found.trim().is_empty(),
            Err(e) => {
                warn!(container_id = %env, error = %e, "Could not check file size ceiling");
                false
            }
        }
    }

    /// Container state fallback when cgroup counters are unreadable
    async fn oom_killed(&self, env: &EnvironmentId) -> bool {
        match self
            .docker
            .inspect_container(&env.0, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|state| state.oom_killed).unwrap_or(false),
            Err(e) => {
                warn!(container_id = %env, error = %e, "Could not inspect sandbox for OOM");
                false
            }
        }
    }

    /// Usage of the exec that just finished, and whether a ceiling ended it
    async fn account(&self, env: &EnvironmentId, exit_code: Option<i64>) -> (ExecUsage, bool) {
        let stats = self.cgroup_stats(env).await;

        let (baseline, limits) = {
            let mut sandboxes = self.sandboxes();
            match sandboxes.get_mut(&env.0) {
                Some(state) => {
                    let previous = state.baseline;
                    if let Some(now) = stats {
                        state.baseline = now;
                    }
                    (Some(previous), Some(state.limits.clone()))
                }
                None => (None, None),
            }
        };

        let delta = stats.zip(baseline).map(|(now, previous)| now.since(&previous));
        let usage = ExecUsage {
            cpu_time_ms: delta.map(|d| d.cpu_time_ms),
            memory_peak_bytes: stats.and_then(|s| s.memory_peak),
        };

        let resource_exceeded = match (exit_code, limits) {
            (Some(EXIT_SIGXFSZ), Some(limits)) => self.file_limit_reached(env, &limits).await,
            (Some(code @ (EXIT_SIGKILL | EXIT_SIGXCPU)), Some(limits)) => match delta {
                Some(delta) => delta.confirms_limit(code, &limits),
                None => code == EXIT_SIGKILL && self.oom_killed(env).await,
            },
            _ => false,
        };

        if resource_exceeded {
            info!(container_id = %env, exit_code = ?exit_code, "Resource ceiling enforced");
        }
        (usage, resource_exceeded)
    }

    /// Remove sandbox containers left behind by a previous process.
    pub async fn reap_orphans(&self) -> Result<usize> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list sandbox containers")?;

        let mut reaped = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            match self.destroy_environment(&EnvironmentId(id.clone())).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!(container_id = %id, error = %e, "Failed to reap orphan sandbox"),
            }
        }
        Ok(reaped)
    }
}

#[async_trait]
impl IsolationSubstrate for DockerSubstrate {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    async fn create_environment(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId> {
        self.ensure_image(&spec.image)
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", spec.image))?;

        let mut labels = spec.labels.clone();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            entrypoint: Some(vec![]),
            user: Some(spec.user.clone()),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            network_disabled: Some(spec.network_disabled),
            labels: Some(labels),
            host_config: Some(host_config(spec)),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;
        let env = EnvironmentId(container.id);

        if let Err(e) = self
            .docker
            .start_container(&env.0, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.destroy_environment(&env).await {
                warn!(container_id = %env, error = %cleanup, "Failed to remove container that never started");
            }
            return Err(e).context("Failed to start Docker container");
        }

        let baseline = self.cgroup_stats(&env).await.unwrap_or_default();
        self.sandboxes().insert(
            env.0.clone(),
            SandboxState {
                limits: spec.limits.clone(),
                baseline,
            },
        );

        debug!(container_id = %env, "Sandbox container started");
        Ok(env)
    }

    #[instrument(skip(self, command), fields(container_id = %env, phase = %command.phase))]
    async fn exec_in(
        &self,
        env: &EnvironmentId,
        command: &ExecCommand,
        sink: &OutputSink,
    ) -> std::result::Result<ExecStatus, ExecError> {
        let exec_config = CreateExecOptions {
            cmd: Some(command.argv.clone()),
            working_dir: Some(command.working_dir.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&env.0, exec_config)
            .await
            .context("Failed to create exec")
            .map_err(ExecError::NotStarted)?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let started = self
            .docker
            .start_exec(&exec.id, Some(start_config))
            .await
            .context("Failed to start exec")
            .map_err(ExecError::NotStarted)?;

        // From here on the program may be running: no failure is retryable

        match started {
            StartExecResults::Attached { mut output, .. } => {
                // Keep draining past the cap so the process never blocks on a full pipe
                while let Some(msg) = output.next().await {
                    match msg.context("Failed to read exec output").map_err(ExecError::Interrupted)? {
                        LogOutput::StdOut { message } => sink.push_stdout(&message),
                        LogOutput::StdErr { message } => sink.push_stderr(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(ExecError::Interrupted(anyhow!("Exec started detached, output unavailable")));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")
            .map_err(ExecError::Interrupted)?;
        let exit_code = inspect.exit_code;
        let (usage, resource_exceeded) = self.account(env, exit_code).await;

        debug!(exit_code = ?exit_code, cpu_time_ms = ?usage.cpu_time_ms, "Exec finished");

        Ok(ExecStatus {
            exit_code,
            resource_exceeded,
            usage,
        })
    }

    async fn kill(&self, env: &EnvironmentId) -> Result<()> {
        match self
            .docker
            .kill_container(&env.0, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_not_running(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to kill sandbox container"),
        }
    }

    async fn destroy_environment(&self, env: &EnvironmentId) -> Result<()> {
        self.sandboxes().remove(&env.0);

        let remove_options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(&env.0, Some(remove_options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e).context("Failed to remove sandbox container"),
        }
    }
}
