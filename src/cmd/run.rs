//! Node commands: `fnforge create`, `fnforge resume` and `fnforge amend`.
//!
//! Each process drives one node. Events go to stdout for the parent (or the
//! operator), operator messages arrive on stdin, diagnostics go to stderr
//! and the node's log file.

use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use fnforge::agent::ClaudeCliAgent;
use fnforge::artifact::store::{STATE_DIR, log_dir};
use fnforge::artifact::validate::ValidatorChain;
use fnforge::config::{CliOverrides, Settings};
use fnforge::errors::OrchestratorError;
use fnforge::event::{AgentEvent, EventSink, write_to_stdout};
use fnforge::inbox::{self, Inbox};
use fnforge::logging;
use fnforge::orchestrator::{Creation, Entry, Orchestrator};
use fnforge::params::GenerationParameters;
use fnforge::persistence::Persistence;
use fnforge::remote::build_remote;
use fnforge::spawner::{SIGNAL_EXIT_CODE, shutdown_signal};
use fnforge::supervisor::{ChildProgram, LiveProcesses};

use super::super::{Cli, CreateArgs};

/// The workspace, created if needed and made absolute so that node
/// directories compare equal across processes.
fn workspace_dir(cli: &Cli) -> Result<PathBuf> {
    let workspace = match &cli.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    absolute_dir(&workspace)
}

fn absolute_dir(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))
}

fn overrides(cli: &Cli) -> CliOverrides {
    CliOverrides {
        claude_cmd: cli.claude_cmd.clone(),
        remote_kind: cli.remote,
        owner: cli.owner.clone(),
        remote_root: cli.remote_root.clone(),
        max_attempts: cli.max_attempts,
    }
}

/// Everything one process needs to drive nodes.
struct Runtime {
    orchestrator: Arc<Orchestrator>,
    events: EventSink,
    writer: JoinHandle<()>,
    agents: LiveProcesses,
}

impl Runtime {
    fn build(settings: &Settings) -> Result<Self> {
        let remote = build_remote(&settings.remote)?;
        let persistence = Persistence::new(remote, settings.author.clone());
        let agents = LiveProcesses::new();
        let agent = Arc::new(
            ClaudeCliAgent::new(settings.claude_cmd.clone(), &settings.workspace)
                .with_skip_permissions(settings.skip_permissions)
                .with_model(settings.model.clone())
                .with_live(agents.clone()),
        );
        let program = ChildProgram::from_settings(settings)?;

        let (events, rx) = EventSink::channel();
        let writer = tokio::spawn(write_to_stdout(rx));

        let inbox = Inbox::new();
        let inbound = inbox::spawn_reader(tokio::io::stdin(), inbox.clone());

        let orchestrator =
            Orchestrator::new(&settings.workspace, agent, persistence, program, events.clone())
                .with_validators(ValidatorChain::standard(settings.test_cmd.clone()))
                .with_max_attempts(settings.max_attempts)
                .with_process_groups(agents.clone())
                .with_messages(inbox, inbound);

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            events,
            writer,
            agents,
        })
    }

    /// Run `work` until it finishes or a termination signal arrives.
    /// Returns the process exit code; every queued event is written first.
    async fn finish<F>(self, announce: bool, work: impl FnOnce(Arc<Orchestrator>) -> F) -> Result<i32>
    where
        F: Future<Output = Result<(), OrchestratorError>>,
    {
        let Runtime {
            orchestrator,
            events,
            writer,
            agents,
        } = self;
        if announce {
            events.emit(AgentEvent::Start { path: String::new() });
        }

        let outcome = tokio::select! {
            result = work(orchestrator.clone()) => Some(result),
            received = shutdown_signal() => {
                warn!(signal = received, "interrupted");
                agents.kill_all();
                None
            }
        };

        if announce {
            events.emit(AgentEvent::Done { path: String::new() });
        }
        drop(orchestrator);
        drop(events);
        let _ = writer.await;

        match outcome {
            None => Ok(SIGNAL_EXIT_CODE),
            Some(Ok(())) => Ok(0),
            Some(Err(err)) => Err(err.into()),
        }
    }
}

fn read_instructions(path: &Path) -> Result<String> {
    let instructions = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read instructions from {}", path.display()))?;
    if instructions.trim().is_empty() {
        anyhow::bail!("Instructions file {} is empty", path.display());
    }
    Ok(instructions)
}

fn creation(args: &CreateArgs) -> Result<Creation> {
    let spec = match &args.spec_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read spec from {}", path.display()))?,
        ),
        None => None,
    };
    let input_schema = match &args.input_schema_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input schema from {}", path.display()))?;
            Some(
                serde_json::from_str(&content)
                    .with_context(|| format!("Input schema {} is not valid JSON", path.display()))?,
            )
        }
        None => None,
    };
    Ok(Creation {
        parameters: GenerationParameters::new(
            args.depth,
            args.branch_min_width,
            args.branch_max_width,
            args.leaf_min_width,
            args.leaf_max_width,
        ),
        name: args.name.clone(),
        function_type: args.function_type,
        spec,
        input_schema,
    })
}

/// Where a new node is built before it has a name.
fn staging_dir(workspace: &Path) -> PathBuf {
    workspace
        .join(STATE_DIR)
        .join("staging")
        .join(chrono::Utc::now().format("%Y%m%d-%H%M%S-%3f").to_string())
}

pub async fn cmd_create(cli: &Cli, args: &CreateArgs) -> Result<i32> {
    let workspace = workspace_dir(cli)?;
    let dir = match (&args.dir, &args.name) {
        (Some(dir), _) => absolute_dir(dir)?,
        (None, Some(name)) => workspace.join(name),
        (None, None) => staging_dir(&workspace),
    };
    let _guard = logging::init(Some(&log_dir(&dir)), cli.verbose)?;
    let settings = Settings::resolve(&workspace, &overrides(cli))?;
    let creation = creation(args)?;
    info!(dir = %dir.display(), "creating function");

    Runtime::build(&settings)?
        .finish(true, |orchestrator| async move {
            let dir = orchestrator.orchestrate(&dir, Entry::Create(creation)).await?;
            info!(dir = %dir.display(), "function tree complete");
            Ok::<(), OrchestratorError>(())
        })
        .await
}

pub async fn cmd_resume(cli: &Cli, dir: &Path, instructions_file: Option<&Path>) -> Result<i32> {
    if !dir.is_dir() {
        anyhow::bail!("{} is not a directory", dir.display());
    }
    let dir = absolute_dir(dir)?;
    let workspace = workspace_dir(cli)?;
    let _guard = logging::init(Some(&log_dir(&dir)), cli.verbose)?;
    let settings = Settings::resolve(&workspace, &overrides(cli))?;
    let entry = match instructions_file {
        Some(path) => Entry::Amend(read_instructions(path)?),
        None => Entry::Resume,
    };
    info!(dir = %dir.display(), "resuming function");

    Runtime::build(&settings)?
        .finish(true, |orchestrator| async move {
            orchestrator.orchestrate(&dir, entry).await?;
            Ok::<(), OrchestratorError>(())
        })
        .await
}

pub async fn cmd_amend(cli: &Cli, names: &[String], instructions_file: &Path) -> Result<i32> {
    let workspace = workspace_dir(cli)?;
    let _guard = logging::init(Some(&log_dir(&workspace)), cli.verbose)?;
    let settings = Settings::resolve(&workspace, &overrides(cli))?;
    let instructions = read_instructions(instructions_file)?;
    info!(functions = ?names, "amending functions");

    Runtime::build(&settings)?
        .finish(false, |orchestrator| async move {
            orchestrator.amend(names, &instructions).await
        })
        .await
}
