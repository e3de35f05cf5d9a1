//! Runs one child `fnforge` process per sub-function.
//!
//! A child is started in its own process group, its stdout is parsed as the
//! event protocol and re-emitted one level up, and its exit resolves to a
//! [`ChildOutcome`]. Nothing here retries.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStdin, Command};

use crate::artifact::store::log_dir;
use crate::artifact::{FunctionType, OwnerRepositoryCommit};
use crate::config::{RemoteKind, Settings};
use crate::event::{self, AgentEvent, EventSink, LineBuffer};
use crate::params::GenerationParameters;
use crate::persistence::inspect;

/// Stderr lines kept for failure reports.
const STDERR_TAIL_LINES: usize = 40;

/// How long terminated children get to shut down before SIGKILL.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(300);

/// Stdin of every running child process, keyed by the child's path below
/// this process's own node (`kid`, or `kid/gk` for a child spawned by an
/// in-process subtree). Operator messages for a child are written here.
pub type ActiveWriters = Arc<tokio::sync::Mutex<HashMap<String, ChildStdin>>>;

/// What a child process is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildCommand {
    Create {
        parameters: GenerationParameters,
        function_type: FunctionType,
        spec: String,
        input_schema: Value,
    },
    Amend {
        instructions: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildInvocation {
    pub name: String,
    pub dir: PathBuf,
    pub command: ChildCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    Success {
        name: String,
        commit: OwnerRepositoryCommit,
    },
    Failure {
        name: String,
        error: String,
    },
}

impl ChildOutcome {
    pub fn name(&self) -> &str {
        match self {
            ChildOutcome::Success { name, .. } | ChildOutcome::Failure { name, .. } => name,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ChildOutcome::Success { .. })
    }
}

/// Process groups of running children; killed together on cancellation.
#[derive(Debug, Clone, Default)]
pub struct LiveProcesses {
    pids: Arc<Mutex<HashSet<u32>>>,
}

impl LiveProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.insert(pid);
        }
    }

    pub fn unregister(&self, pid: u32) {
        if let Ok(mut pids) = self.pids.lock() {
            pids.remove(&pid);
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.pids
            .lock()
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Register `pid` until the returned guard drops. Dropping the guard
    /// also kills the group, which reaps anything the leader left behind.
    pub fn track(&self, pid: u32) -> TrackedGroup {
        self.register(pid);
        TrackedGroup {
            live: self.clone(),
            pid,
        }
    }

    fn drain(&self) -> Vec<u32> {
        self.pids
            .lock()
            .map(|mut pids| pids.drain().collect())
            .unwrap_or_default()
    }

    /// SIGKILL every registered process group.
    pub fn kill_all(&self) {
        for pid in self.drain() {
            kill_group(pid);
        }
    }

    /// SIGTERM every registered process group, then SIGKILL them after
    /// [`TERMINATE_GRACE`]. A child `fnforge` uses the grace period to take
    /// down its own agent and children, which live in groups of their own.
    pub fn terminate_all(&self) {
        let pids = self.drain();
        if pids.is_empty() {
            return;
        }
        for pid in &pids {
            terminate_group(*pid);
        }
        std::thread::sleep(TERMINATE_GRACE);
        for pid in pids {
            kill_group(pid);
        }
    }
}

/// A process group registered in [`LiveProcesses`] for the guard's lifetime.
#[derive(Debug)]
pub struct TrackedGroup {
    live: LiveProcesses,
    pid: u32,
}

impl Drop for TrackedGroup {
    fn drop(&mut self) {
        let registered = self
            .live
            .pids
            .lock()
            .map(|mut pids| pids.remove(&self.pid))
            .unwrap_or(false);
        if registered {
            kill_group(self.pid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid, %err, "killpg failed");
    } else {
        tracing::warn!(pid, "killed child process group");
    }
}

#[cfg(unix)]
fn terminate_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Err(err) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(pid, %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32) {}

#[cfg(not(unix))]
fn kill_group(pid: u32) {
    tracing::warn!(pid, "process group kill is not supported on this platform");
}

/// How child processes are launched: a program, the arguments that precede
/// every invocation, and environment forwarded to every child.
#[derive(Debug, Clone)]
pub struct ChildProgram {
    program: PathBuf,
    base_args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ChildProgram {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_base_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// This executable, configured to share the parent's workspace, remote
    /// and agent settings. The remote token travels in the environment.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the fnforge executable")?;
        let mut args = vec![
            "--workspace".to_string(),
            settings.workspace.display().to_string(),
            "--remote".to_string(),
            settings.remote.kind.to_string(),
            "--owner".to_string(),
            settings.remote.owner.clone(),
            "--max-attempts".to_string(),
            settings.max_attempts.to_string(),
            "--claude-cmd".to_string(),
            settings.claude_cmd.clone(),
        ];
        if settings.remote.kind == RemoteKind::Local {
            args.push("--remote-root".to_string());
            args.push(settings.remote.local_root.display().to_string());
        }
        let mut program = Self::new(exe).with_base_args(args);
        if let Some(token) = &settings.remote.token {
            program = program.with_env("GITHUB_TOKEN", token);
        }
        Ok(program)
    }

    /// Subcommand arguments for `invocation`. Multi-line inputs are written
    /// to files under `files`, which must outlive the child.
    pub fn invocation_args(&self, invocation: &ChildInvocation, files: &Path) -> Result<Vec<String>> {
        let dir = invocation.dir.display().to_string();
        match &invocation.command {
            ChildCommand::Create {
                parameters,
                function_type,
                spec,
                input_schema,
            } => {
                let spec_file = files.join("spec.md");
                std::fs::write(&spec_file, spec).context("Failed to write spec file")?;
                let schema_file = files.join("input_schema.json");
                let schema = serde_json::to_string_pretty(input_schema)
                    .context("Failed to serialize input schema")?;
                std::fs::write(&schema_file, schema).context("Failed to write input schema file")?;
                Ok(vec![
                    "create".to_string(),
                    "--dir".to_string(),
                    dir,
                    "--name".to_string(),
                    invocation.name.clone(),
                    "--function-type".to_string(),
                    function_type.to_string(),
                    "--depth".to_string(),
                    parameters.depth.to_string(),
                    "--branch-min-width".to_string(),
                    parameters.branch_min_width.to_string(),
                    "--branch-max-width".to_string(),
                    parameters.branch_max_width.to_string(),
                    "--leaf-min-width".to_string(),
                    parameters.leaf_min_width.to_string(),
                    "--leaf-max-width".to_string(),
                    parameters.leaf_max_width.to_string(),
                    "--spec-file".to_string(),
                    spec_file.display().to_string(),
                    "--input-schema-file".to_string(),
                    schema_file.display().to_string(),
                ])
            }
            ChildCommand::Amend { instructions } => {
                let instructions_file = files.join("instructions.md");
                std::fs::write(&instructions_file, instructions)
                    .context("Failed to write instructions file")?;
                Ok(vec![
                    "resume".to_string(),
                    dir,
                    "--instructions-file".to_string(),
                    instructions_file.display().to_string(),
                ])
            }
        }
    }
}

/// Run one child to completion. `start` and `done` are emitted for the
/// child whatever happens.
pub async fn supervise(
    program: &ChildProgram,
    invocation: ChildInvocation,
    writers: ActiveWriters,
    events: EventSink,
    live: LiveProcesses,
) -> ChildOutcome {
    let name = invocation.name.clone();
    events.emit(AgentEvent::Start { path: name.clone() });
    let result = run_child(program, &invocation, &writers, &events, &live).await;
    events.emit(AgentEvent::Done { path: name.clone() });
    match result {
        Ok(commit) => {
            tracing::info!(child = %name, %commit, "child succeeded");
            ChildOutcome::Success { name, commit }
        }
        Err(error) => {
            tracing::warn!(child = %name, %error, "child failed");
            ChildOutcome::Failure { name, error }
        }
    }
}

async fn run_child(
    program: &ChildProgram,
    invocation: &ChildInvocation,
    writers: &ActiveWriters,
    events: &EventSink,
    live: &LiveProcesses,
) -> Result<OwnerRepositoryCommit, String> {
    let name = invocation.name.as_str();
    let key = events.child_path(name);
    std::fs::create_dir_all(&invocation.dir)
        .map_err(|e| format!("failed to create {}: {}", invocation.dir.display(), e))?;
    let files = tempfile::tempdir().map_err(|e| format!("failed to create temp dir: {}", e))?;
    let args = program
        .invocation_args(invocation, files.path())
        .map_err(|e| format!("{:#}", e))?;

    let mut command = Command::new(&program.program);
    command
        .args(&program.base_args)
        .args(&args)
        .envs(program.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(&invocation.dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", program.program.display(), e))?;
    let pid = child.id();
    if let Some(pid) = pid {
        live.register(pid);
    }
    tracing::debug!(child = %name, ?pid, "spawned");
    if let Some(stdin) = child.stdin.take() {
        writers.lock().await.insert(key.clone(), stdin);
    }

    let stderr_tail = child.stderr.take().map(|stderr| tokio::spawn(tail_lines(stderr)));
    if let Some(mut stdout) = child.stdout.take() {
        let mut buffer = LineBuffer::new();
        let mut chunk = [0u8; 8192];
        loop {
            match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in buffer.push(&chunk[..n]) {
                        forward_line(&line, name, events);
                    }
                }
                Err(err) => {
                    tracing::debug!(child = %name, %err, "stdout read failed");
                    break;
                }
            }
        }
        if let Some(line) = buffer.finish() {
            forward_line(&line, name, events);
        }
    }

    let status = child.wait().await;
    writers.lock().await.remove(&key);
    if let Some(pid) = pid {
        live.unregister(pid);
    }
    let stderr = match stderr_tail {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    match status {
        Err(err) => Err(format!("failed to wait for child: {}", err)),
        Ok(status) if status.success() => inspect(&invocation.dir).map_err(|e| format!("{:#}", e)),
        Ok(status) if stderr.trim().is_empty() => Err(format!(
            "{}; see logs in {}",
            status,
            log_dir(&invocation.dir).display()
        )),
        Ok(status) => Err(format!("{}: {}", status, stderr.trim_end())),
    }
}

/// Re-emit one child line under the child's name. The child's own
/// start/done are dropped; the supervisor emits those.
fn forward_line(line: &str, name: &str, events: &EventSink) {
    let Some(event) = event::parse(line) else {
        return;
    };
    if matches!(&event, AgentEvent::Start { path } | AgentEvent::Done { path } if path.is_empty()) {
        return;
    }
    events.emit(event::prefix(event, name));
}

async fn tail_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}
