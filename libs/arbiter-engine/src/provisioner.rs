// Sandbox provisioning: one isolated environment per submission

use crate::error::EngineError;
use crate::registry::LanguageProfile;
use crate::substrate::{
    EnvironmentId, EnvironmentSpec, ExecCommand, ExecError, ExecStatus, IsolationSubstrate, OutputSink,
    LABEL_LANGUAGE, LABEL_SUBMISSION,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Scoped ownership of one sandbox.
///
/// [`SandboxHandle::release`] consumes the handle, so it can run at most
/// once. A handle dropped without release (panic, dropped future) destroys
/// its environment on a background task instead of leaking it.
pub struct SandboxHandle {
    submission_id: Uuid,
    env: Option<EnvironmentId>,
    substrate: Arc<dyn IsolationSubstrate>,
}

impl SandboxHandle {
    pub fn submission_id(&self) -> Uuid {
        self.submission_id
    }

    pub fn environment(&self) -> Option<&EnvironmentId> {
        self.env.as_ref()
    }

    pub(crate) async fn exec(&self, command: &ExecCommand, output: &OutputSink) -> Result<ExecStatus, ExecError> {
        match &self.env {
            Some(env) => self.substrate.exec_in(env, command, output).await,
            None => Err(ExecError::NotStarted(anyhow::anyhow!("sandbox already released"))),
        }
    }

    /// Kill every process in the sandbox, leaving it in place for release.
    pub(crate) async fn terminate(&self) {
        if let Some(env) = &self.env {
            if let Err(e) = self.substrate.kill(env).await {
                warn!(submission_id = %self.submission_id, error = %e, "Failed to kill sandbox");
            }
        }
    }

    /// Tear the environment down and reclaim its resources.
    pub async fn release(mut self) -> anyhow::Result<()> {
        match self.env.take() {
            Some(env) => {
                debug!(submission_id = %self.submission_id, environment = %env, "Releasing sandbox");
                self.substrate.destroy_environment(&env).await
            }
            None => Ok(()),
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        let Some(env) = self.env.take() else { return };
        let substrate = Arc::clone(&self.substrate);
        let submission_id = self.submission_id;

        warn!(submission_id = %submission_id, environment = %env, "Sandbox dropped without release, destroying in background");

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = substrate.destroy_environment(&env).await {
                        warn!(submission_id = %submission_id, error = %e, "Failed to destroy dropped sandbox");
                    }
                });
            }
            Err(_) => {
                warn!(submission_id = %submission_id, environment = %env, "No runtime available, sandbox leaked until orphan reaping");
            }
        }
    }
}

pub struct SandboxProvisioner {
    substrate: Arc<dyn IsolationSubstrate>,
    sandbox_user: String,
    /// (local root, host root) for bind-mount path translation
    path_translation: Option<(PathBuf, PathBuf)>,
}

/// Reject identities that would run sandboxed code as root.
fn is_privileged_user(user: &str) -> bool {
    let uid = user.split(':').next().unwrap_or("").trim();
    uid.is_empty() || uid == "0" || uid == "root"
}

impl SandboxProvisioner {
    pub fn new(substrate: Arc<dyn IsolationSubstrate>, sandbox_user: impl Into<String>) -> Result<Self, EngineError> {
        let sandbox_user = sandbox_user.into();
        if is_privileged_user(&sandbox_user) {
            return Err(EngineError::Config(format!(
                "sandbox user '{}' is privileged; a non-root identity is required",
                sandbox_user
            )));
        }
        Ok(Self {
            substrate,
            sandbox_user,
            path_translation: None,
        })
    }

    /// Translate bind-mount sources from `local_root` to `host_root`.
    ///
    /// Needed when this process runs in a container that talks to the host's
    /// Docker daemon: the daemon resolves bind paths on the host.
    pub fn with_host_root(mut self, local_root: PathBuf, host_root: PathBuf) -> Self {
        self.path_translation = Some((local_root, host_root));
        self
    }

    pub fn substrate(&self) -> &Arc<dyn IsolationSubstrate> {
        &self.substrate
    }

    fn mount_source(&self, working_dir: &Path) -> PathBuf {
        match &self.path_translation {
            Some((local, host)) => match working_dir.strip_prefix(local) {
                Ok(rest) => host.join(rest),
                Err(_) => working_dir.to_path_buf(),
            },
            None => working_dir.to_path_buf(),
        }
    }

    /// Build the environment description. Limits come from the profile and
    /// are always attached.
    ///
    /// Names carry a per-attempt suffix: a container left behind by a failed
    /// attempt must not block the retry with a name conflict.
    pub fn environment_spec(
        &self,
        profile: &LanguageProfile,
        submission_id: Uuid,
        working_dir: &Path,
    ) -> EnvironmentSpec {
        EnvironmentSpec {
            name: format!("arbiter-{}-{}", submission_id, &Uuid::new_v4().simple().to_string()[..8]),
            image: profile.image.clone(),
            user: self.sandbox_user.clone(),
            limits: profile.limits.clone(),
            submission_source: self.mount_source(working_dir),
            network_disabled: true,
            labels: HashMap::from([
                (LABEL_SUBMISSION.to_string(), submission_id.to_string()),
                (LABEL_LANGUAGE.to_string(), profile.id.clone()),
            ]),
        }
    }

    /// Create an isolated environment bound to one submission.
    pub async fn acquire(
        &self,
        profile: &LanguageProfile,
        submission_id: Uuid,
        working_dir: &Path,
    ) -> Result<SandboxHandle, EngineError> {
        let spec = self.environment_spec(profile, submission_id, working_dir);

        if !spec.network_disabled || is_privileged_user(&spec.user) {
            return Err(EngineError::Provision {
                id: submission_id,
                reason: "sandbox capability preconditions not met".to_string(),
            });
        }

        let env = self
            .substrate
            .create_environment(&spec)
            .await
            .map_err(|e| EngineError::Provision {
                id: submission_id,
                reason: format!("{:#}", e),
            })?;

        debug!(
            submission_id = %submission_id,
            environment = %env,
            substrate = self.substrate.name(),
            memory_mb = spec.limits.memory_mb,
            "Sandbox provisioned"
        );

        Ok(SandboxHandle {
            submission_id,
            env: Some(env),
            substrate: Arc::clone(&self.substrate),
        })
    }

    /// Release a sandbox. Failures are logged, never returned.
    pub async fn release(&self, handle: SandboxHandle) {
        let submission_id = handle.submission_id();
        if let Err(e) = handle.release().await {
            warn!(submission_id = %submission_id, error = %e, "Failed to release sandbox");
        }
    }
}
