// In-memory substrate and fixtures shared by the engine's unit tests

use crate::registry::{LanguageProfile, LanguageRegistry, ResourceLimits};
use crate::substrate::{
    EnvironmentId, EnvironmentSpec, ExecCommand, ExecError, ExecStatus, ExecUsage, IsolationSubstrate, OutputSink,
    Phase, LABEL_SUBMISSION,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

pub fn python_profile() -> LanguageProfile {
    LanguageProfile {
        id: "python3.12".to_string(),
        image: "python:3.12-slim".to_string(),
        compile_command: None,
        run_command: "python3 -u {source}".to_string(),
        file_extension: "py".to_string(),
        source_stem: "main".to_string(),
        limits: ResourceLimits::default(),
    }
}

pub fn cpp_profile() -> LanguageProfile {
    LanguageProfile {
        id: "cpp17".to_string(),
        image: "gcc:13".to_string(),
        compile_command: Some("g++ -std=c++17 -O2 -o {workspace}/main {source}".to_string()),
        run_command: "{workspace}/main".to_string(),
        file_extension: "cpp".to_string(),
        source_stem: "main".to_string(),
        limits: ResourceLimits::default(),
    }
}

pub fn registry() -> LanguageRegistry {
    LanguageRegistry::from_profiles(vec![python_profile(), cpp_profile()]).unwrap()
}

/// What a scripted exec does
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    Exit { code: i64, stdout: Vec<u8>, stderr: Vec<u8> },
    /// Sleep, then exit 0 with no output
    Sleep(Duration),
    /// Write to stdout, then never finish on its own
    Hang(Vec<u8>),
    /// Exit 0 after writing this many bytes to stdout
    Flood(usize),
    /// Exit 137 confirmed by the substrate as a resource ceiling hit
    ResourceExceeded,
}

/// How environment creation stalls
#[derive(Debug, Clone, Copy)]
enum CreateStall {
    None,
    Delay(Duration),
    Forever,
}

impl FakeBehavior {
    pub fn hang() -> Self {
        FakeBehavior::Hang(Vec::new())
    }

    pub fn exit(code: i64, stdout: &str, stderr: &str) -> Self {
        FakeBehavior::Exit {
            code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug)]
struct FakeState {
    next_id: usize,
    live: HashSet<EnvironmentId>,
    peak_live: usize,
    destroyed: HashMap<EnvironmentId, usize>,
    created_for: Vec<String>,
    kills: usize,
    create_failures: usize,
    /// Failed creates leave their container name taken
    leave_failed_names: bool,
    names: HashSet<String>,
    create_stall: CreateStall,
    exec_failures: usize,
    exec_interruptions: usize,
    usage: ExecUsage,
    compile: FakeBehavior,
    run: FakeBehavior,
    executed: Vec<ExecCommand>,
}

/// Substrate that never touches a container runtime.
///
/// Every exec follows the scripted behavior for its phase.
#[derive(Debug)]
pub struct FakeSubstrate {
    state: Mutex<FakeState>,
}

impl FakeSubstrate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 0,
                live: HashSet::new(),
                peak_live: 0,
                destroyed: HashMap::new(),
                created_for: Vec::new(),
                kills: 0,
                create_failures: 0,
                leave_failed_names: false,
                names: HashSet::new(),
                create_stall: CreateStall::None,
                exec_failures: 0,
                exec_interruptions: 0,
                usage: ExecUsage::default(),
                compile: FakeBehavior::exit(0, "", ""),
                run: FakeBehavior::exit(0, "", ""),
                executed: Vec::new(),
            }),
        }
    }

    pub fn set_compile(&self, behavior: FakeBehavior) {
        self.state.lock().unwrap().compile = behavior;
    }

    pub fn set_run(&self, behavior: FakeBehavior) {
        self.state.lock().unwrap().run = behavior;
    }

    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().unwrap().create_failures = n;
    }

    /// Make the next `n` creates fail after taking their container name,
    /// like a container that was created but could not be started or removed.
    pub fn fail_next_creates_leaving_names(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.create_failures = n;
        state.leave_failed_names = true;
    }

    pub fn delay_creates(&self, delay: Duration) {
        self.state.lock().unwrap().create_stall = CreateStall::Delay(delay);
    }

    pub fn hang_creates(&self) {
        self.state.lock().unwrap().create_stall = CreateStall::Forever;
    }

    /// The next `n` execs fail before their process starts
    pub fn fail_next_execs(&self, n: usize) {
        self.state.lock().unwrap().exec_failures = n;
    }

    /// The next `n` execs start, write their output, then lose their exit status
    pub fn interrupt_next_execs(&self, n: usize) {
        self.state.lock().unwrap().exec_interruptions = n;
    }

    pub fn set_usage(&self, usage: ExecUsage) {
        self.state.lock().unwrap().usage = usage;
    }

    pub fn destroy_count(&self, env: &EnvironmentId) -> usize {
        self.state.lock().unwrap().destroyed.get(env).copied().unwrap_or(0)
    }

    pub fn total_destroyed(&self) -> usize {
        self.state.lock().unwrap().destroyed.values().sum()
    }

    pub fn live_environments(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn peak_live(&self) -> usize {
        self.state.lock().unwrap().peak_live
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created_for.len()
    }

    /// Submission ids in the order their environments were created
    pub fn created_for(&self) -> Vec<String> {
        self.state.lock().unwrap().created_for.clone()
    }

    pub fn kill_count(&self) -> usize {
        self.state.lock().unwrap().kills
    }

    pub fn executed(&self) -> Vec<ExecCommand> {
        self.state.lock().unwrap().executed.clone()
    }
}

#[async_trait]
impl IsolationSubstrate for FakeSubstrate {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_environment(&self, spec: &EnvironmentSpec) -> anyhow::Result<EnvironmentId> {
        let stall = self.state.lock().unwrap().create_stall;
        match stall {
            CreateStall::None => {}
            CreateStall::Delay(delay) => tokio::time::sleep(delay).await,
            CreateStall::Forever => std::future::pending::<()>().await,
        }

        let mut state = self.state.lock().unwrap();
        if state.names.contains(&spec.name) {
            anyhow::bail!("container name {} is already in use", spec.name);
        }
        if state.create_failures > 0 {
            state.create_failures -= 1;
            if state.leave_failed_names {
                state.names.insert(spec.name.clone());
            }
            anyhow::bail!("fake substrate refused to create {}", spec.name);
        }
        state.names.insert(spec.name.clone());

        state.next_id += 1;
        let env = EnvironmentId(format!("fake-{}", state.next_id));
        state.live.insert(env.clone());
        state.peak_live = state.peak_live.max(state.live.len());
        let owner = spec.labels.get(LABEL_SUBMISSION).cloned().unwrap_or_default();
        state.created_for.push(owner);
        Ok(env)
    }

    async fn exec_in(
        &self,
        env: &EnvironmentId,
        command: &ExecCommand,
        output: &OutputSink,
    ) -> Result<ExecStatus, ExecError> {
        let (behavior, interrupted, usage) = {
            let mut state = self.state.lock().unwrap();
            if !state.live.contains(env) {
                return Err(ExecError::NotStarted(anyhow::anyhow!("no such environment: {}", env)));
            }
            state.executed.push(command.clone());
            if state.exec_failures > 0 {
                state.exec_failures -= 1;
                return Err(ExecError::NotStarted(anyhow::anyhow!("fake substrate could not start exec in {}", env)));
            }
            let interrupted = state.exec_interruptions > 0;
            if interrupted {
                state.exec_interruptions -= 1;
            }
            let behavior = match command.phase {
                Phase::Compile => state.compile.clone(),
                Phase::Run => state.run.clone(),
            };
            (behavior, interrupted, state.usage)
        };

        let (exit_code, resource_exceeded) = match behavior {
            FakeBehavior::Exit { code, stdout, stderr } => {
                output.push_stdout(&stdout);
                output.push_stderr(&stderr);
                (code, false)
            }
            FakeBehavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                (0, false)
            }
            FakeBehavior::Hang(partial) => {
                output.push_stdout(&partial);
                std::future::pending::<(i64, bool)>().await
            }
            FakeBehavior::Flood(bytes) => {
                let chunk = [b'x'; 4096];
                let mut remaining = bytes;
                while remaining > 0 {
                    let take = remaining.min(chunk.len());
                    output.push_stdout(&chunk[..take]);
                    remaining -= take;
                }
                (0, false)
            }
            FakeBehavior::ResourceExceeded => (137, true),
        };

        if interrupted {
            return Err(ExecError::Interrupted(anyhow::anyhow!("fake substrate lost the exec stream in {}", env)));
        }

        Ok(ExecStatus {
            exit_code: Some(exit_code),
            resource_exceeded,
            usage,
        })
    }

    async fn kill(&self, _env: &EnvironmentId) -> anyhow::Result<()> {
        self.state.lock().unwrap().kills += 1;
        Ok(())
    }

    async fn destroy_environment(&self, env: &EnvironmentId) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.live.remove(env);
        *state.destroyed.entry(env.clone()).or_insert(0) += 1;
        Ok(())
    }
}
