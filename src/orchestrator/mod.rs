//! Drives one node of a function tree, and through it the whole subtree.
//!
//! A node is created by the phase pipeline and the build loop, then its
//! placeholders are fanned out to child processes. Published children are
//! resumed in-process instead of respawned, and once everything settles the
//! closer rewires the node to its children's commits. Every step checks
//! what is already on disk and on the remote first, so re-running a
//! crashed tree only does the missing work.

use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::agent::{Agent, AgentSession, SessionHandle, ToolContext};
use crate::artifact::store::{SessionStore, load_artifact, save_artifact};
use crate::artifact::validate::{ValidatorChain, structural_errors};
use crate::artifact::{ArtifactState, FunctionType, Task, Variant};
use crate::closer::Closer;
use crate::errors::OrchestratorError;
use crate::event::{AgentEvent, EventSink};
use crate::inbox::{InboundMessage, Inbox};
use crate::params::GenerationParameters;
use crate::persistence::Persistence;
use crate::phase::PhaseRunner;
use crate::spawner::{SpawnMode, Spawner, spawn_relay};
use crate::submit::{BuildGoal, DEFAULT_MAX_ATTEMPTS, SubmitLoop};
use crate::supervisor::{
    ActiveWriters, ChildCommand, ChildInvocation, ChildOutcome, ChildProgram, LiveProcesses,
};

/// Seed values for a node being created. Anything left `None` is produced
/// by the phase pipeline.
#[derive(Debug, Clone, Default)]
pub struct Creation {
    pub parameters: GenerationParameters,
    pub name: Option<String>,
    pub function_type: Option<FunctionType>,
    pub spec: Option<String>,
    pub input_schema: Option<Value>,
}

impl Creation {
    pub fn seed(&self) -> ArtifactState {
        let mut state = ArtifactState::new(self.parameters);
        state.name = self.name.clone();
        state.function_type = self.function_type;
        state.spec = self.spec.clone();
        state.function.input_schema = self.input_schema.clone();
        state
    }
}

/// How a node run begins.
#[derive(Debug, Clone)]
pub enum Entry {
    /// Prepare, build and submit a new node.
    Create(Creation),
    /// Continue an existing node's subtree.
    Resume,
    /// Rebuild an existing node according to operator instructions.
    Amend(String),
}

pub struct Orchestrator {
    workspace: PathBuf,
    agent: Arc<dyn Agent>,
    persistence: Persistence,
    program: ChildProgram,
    validators: ValidatorChain,
    max_attempts: u32,
    events: EventSink,
    inbox: Inbox,
    writers: ActiveWriters,
    process: LiveProcesses,
}

impl Orchestrator {
    pub fn new(
        workspace: &Path,
        agent: Arc<dyn Agent>,
        persistence: Persistence,
        program: ChildProgram,
        events: EventSink,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            agent,
            persistence,
            program,
            validators: ValidatorChain::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            events,
            inbox: Inbox::new(),
            writers: ActiveWriters::default(),
            process: LiveProcesses::new(),
        }
    }

    pub fn with_validators(mut self, validators: ValidatorChain) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Operator messages: `inbox` for this node, `inbound` for the nodes
    /// below it. Starts the relay that forwards `inbound` to running
    /// children; it stops when `inbound` closes.
    pub fn with_messages(mut self, inbox: Inbox, inbound: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        self.inbox = inbox;
        spawn_relay(inbound, self.writers.clone());
        self
    }

    /// Process groups that live outside any batch, killed along with the
    /// children when a termination signal arrives mid-batch.
    pub fn with_process_groups(mut self, process: LiveProcesses) -> Self {
        self.process = process;
        self
    }

    /// Directory of the node called `name`.
    pub fn node_dir(&self, name: &str) -> PathBuf {
        self.workspace.join(name)
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext::new(&self.workspace)
            .with_remote(self.persistence.remote().clone())
            .with_events(self.events.clone())
    }

    fn spawner(&self, events: &EventSink) -> Spawner {
        Spawner::new(self.program.clone(), self.persistence.clone(), events.clone())
            .with_writers(self.writers.clone())
            .with_process_groups(self.process.clone())
    }

    /// Run the node at `dir` and its subtree. Returns the node's final
    /// directory, which differs from `dir` when a new node was prepared in a
    /// staging directory before it had a name.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub async fn orchestrate(&self, dir: &Path, entry: Entry) -> Result<PathBuf, OrchestratorError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", dir.display(), e))?;
        let stored = SessionStore::new(dir).load()?.session_id.map(SessionHandle);
        let mut session = AgentSession::resume(stored);

        let dir = match entry {
            Entry::Create(creation) => {
                let mut state = match load_artifact(dir)? {
                    Some(existing) => {
                        info!("resuming partially created node");
                        existing
                    }
                    None => creation.seed(),
                };
                save_artifact(dir, &state)?;
                PhaseRunner::new(self.agent.as_ref(), dir, self.tool_context(), self.inbox.clone())
                    .run_all(&mut state, &mut session)
                    .await?;
                let dir = self.settle_dir(dir, &state)?;

                let submitted = structural_errors(&state).is_empty()
                    && self.persistence.finalized(&dir).await?.is_some();
                if submitted {
                    info!("already submitted");
                } else {
                    self.build(&dir, &mut state, &mut session, BuildGoal::Create).await?;
                }
                dir
            }
            Entry::Resume => dir.to_path_buf(),
            Entry::Amend(instructions) => {
                let mut state = load_artifact(dir)?.ok_or_else(|| {
                    anyhow::anyhow!("{} has no artifact to amend", dir.display())
                })?;
                self.build(dir, &mut state, &mut session, BuildGoal::Amend(&instructions))
                    .await?;
                dir.to_path_buf()
            }
        };

        self.continue_tree(&dir).await?;
        Ok(dir)
    }

    async fn build(
        &self,
        dir: &Path,
        state: &mut ArtifactState,
        session: &mut AgentSession,
        goal: BuildGoal<'_>,
    ) -> Result<(), OrchestratorError> {
        SubmitLoop::new(
            self.agent.as_ref(),
            dir,
            self.tool_context(),
            self.inbox.clone(),
            &self.validators,
            &self.persistence,
        )
        .with_max_attempts(self.max_attempts)
        .run(state, session, goal)
        .await?;
        Ok(())
    }

    /// Move a node prepared outside the workspace layout to
    /// `<workspace>/<name>`.
    fn settle_dir(&self, dir: &Path, state: &ArtifactState) -> Result<PathBuf, OrchestratorError> {
        let Some(name) = &state.name else {
            return Ok(dir.to_path_buf());
        };
        let target = self.node_dir(name);
        if target == dir {
            return Ok(target);
        }
        if target.exists() {
            return Err(anyhow::anyhow!(
                "cannot move {} to {}: target exists",
                dir.display(),
                target.display()
            )
            .into());
        }
        std::fs::rename(dir, &target).map_err(|e| {
            anyhow::anyhow!("Failed to move {} to {}: {}", dir.display(), target.display(), e)
        })?;
        info!(from = %dir.display(), to = %target.display(), "node directory settled");
        Ok(target)
    }

    /// Steps after creation: validate, persist, fan out, close.
    pub async fn continue_tree(&self, dir: &Path) -> Result<(), OrchestratorError> {
        self.continue_node(dir, self.events.clone(), Vec::new()).await
    }

    /// [`Self::continue_tree`] for a node whose events go to `events`, which
    /// is scoped to the node's place in the tree when it runs in-process
    /// below this process's own node. `ancestors` are the directories of the
    /// in-process nodes above it.
    fn continue_node<'a>(
        &'a self,
        dir: &'a Path,
        events: EventSink,
        ancestors: Vec<PathBuf>,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            let Some(mut state) = load_artifact(dir)? else {
                warn!(dir = %dir.display(), "no artifact; nothing to orchestrate");
                return Ok(());
            };
            let invalid = structural_errors(&state);
            if !invalid.is_empty() {
                warn!(dir = %dir.display(), errors = ?invalid, "artifact is invalid; stopping");
                events.log(format!("stopping: artifact is invalid: {}", invalid.join("; ")));
                return Ok(());
            }
            let name = state
                .name
                .clone()
                .ok_or_else(|| anyhow::anyhow!("{} has no name", dir.display()))?;

            if self.persistence.finalized(dir).await?.is_none() {
                self.persistence
                    .commit_and_push(dir, &name, &format!("Save {}", name))
                    .await?;
            }

            let Some(variant) = state.variant() else {
                return Ok(());
            };
            match variant {
                Variant::ScalarLeaf | Variant::VectorLeaf => {
                    info!(node = %name, "leaf complete");
                    return Ok(());
                }
                Variant::ScalarBranch | Variant::VectorBranch => {}
            }

            let mut lineage = ancestors;
            lineage.push(dir.to_path_buf());
            let errors = self.fan_out(&lineage, &state, &events).await;

            Closer::new(&self.workspace, self.persistence.clone(), events.clone())
                .close(dir, &mut state)
                .await?;
            OrchestratorError::collect(errors)
        })
    }

    /// Resume published children in-process and spawn the rest. Every
    /// failure is collected; none short-circuits its siblings.
    /// `lineage` ends with the node's own directory.
    async fn fan_out(&self, lineage: &[PathBuf], state: &ArtifactState, events: &EventSink) -> Vec<OrchestratorError> {
        let mut errors = Vec::new();
        let mut resumes = Vec::new();
        let mut fresh = Vec::new();
        let mut stale = Vec::new();

        for (index, spec) in state.placeholders() {
            let child_dir = self.node_dir(&spec.name);
            if lineage.contains(&child_dir) {
                errors.push(OrchestratorError::ChildFailed {
                    name: spec.name.clone(),
                    error: "placeholder reuses the name of a node above it".to_string(),
                });
                continue;
            }
            match self.persistence.published(&child_dir).await {
                Ok(Some(_)) => {
                    resumes.push(spec.name.clone());
                    continue;
                }
                Ok(None) => {}
                Err(err) => warn!(child = %spec.name, "published check failed: {:#}", err),
            }
            let Some(Task::Placeholder {
                function_type,
                input_schema,
                ..
            }) = state.function.tasks.get(index)
            else {
                continue;
            };
            let invocation = ChildInvocation {
                name: spec.name.clone(),
                dir: child_dir.clone(),
                command: ChildCommand::Create {
                    parameters: state.parameters.child(),
                    function_type: *function_type,
                    spec: spec.spec.clone(),
                    input_schema: input_schema.clone(),
                },
            };
            if child_dir.exists() {
                stale.push(invocation);
            } else {
                fresh.push(invocation);
            }
        }

        let resumed = join_all(resumes.into_iter().map(|name| async move {
            let child_dir = self.node_dir(&name);
            events.emit(AgentEvent::Start { path: name.clone() });
            let result = self
                .continue_node(&child_dir, events.scoped(&name), lineage.to_vec())
                .await;
            events.emit(AgentEvent::Done { path: name.clone() });
            result.err().map(|err| OrchestratorError::ChildFailed {
                name,
                error: err.to_string(),
            })
        }));
        let spawned = join_all(
            [(SpawnMode::New, fresh), (SpawnMode::Respawn, stale)]
                .into_iter()
                .filter(|(_, batch)| !batch.is_empty())
                .map(|(mode, batch)| async move {
                    match self.spawner(events).spawn_batch(mode, batch).await {
                        Ok(outcomes) => outcomes
                            .into_iter()
                            .filter_map(|outcome| match outcome {
                                ChildOutcome::Success { .. } => None,
                                ChildOutcome::Failure { name, error } => {
                                    Some(OrchestratorError::ChildFailed { name, error })
                                }
                            })
                            .collect(),
                        Err(err) => vec![err],
                    }
                }),
        );

        let (resumed, spawned) = tokio::join!(resumed, spawned);
        errors.extend(resumed.into_iter().flatten());
        errors.extend(spawned.into_iter().flatten());
        errors
    }

    /// Amend existing nodes of the workspace, each in its own child process.
    pub async fn amend(&self, names: &[String], instructions: &str) -> Result<(), OrchestratorError> {
        let invocations = names
            .iter()
            .map(|name| ChildInvocation {
                name: name.clone(),
                dir: self.node_dir(name),
                command: ChildCommand::Amend {
                    instructions: instructions.to_string(),
                },
            })
            .collect();
        let outcomes = self
            .spawner(&self.events)
            .spawn_batch(SpawnMode::Amend, invocations)
            .await?;
        let errors = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                ChildOutcome::Success { .. } => None,
                ChildOutcome::Failure { name, error } => Some(OrchestratorError::ChildFailed { name, error }),
            })
            .collect();
        OrchestratorError::collect(errors)
    }
}
