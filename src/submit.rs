//! Build, validate and submit a node's function.
//!
//! Each attempt is one agent turn followed by validation. A valid artifact
//! is committed and pushed; otherwise every reason the attempt failed is fed
//! into the next attempt's instruction until the budget runs out.

use anyhow::anyhow;
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::agent::{Agent, AgentSession, ToolBox, ToolContext, ToolKind};
use crate::artifact::store::{SessionStore, read_readme, save_artifact};
use crate::artifact::validate::ValidatorChain;
use crate::artifact::{ArtifactState, OwnerRepositoryCommit, Variant};
use crate::errors::OrchestratorError;
use crate::inbox::Inbox;
use crate::persistence::Persistence;

/// Default number of build attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What the build loop is asked to do with the artifact.
#[derive(Debug, Clone, Copy)]
pub enum BuildGoal<'a> {
    /// Build the function from the prepared spec and essays.
    Create,
    /// Change an existing function according to operator instructions.
    Amend(&'a str),
}

/// Tools the agent may use while building a function of `variant`.
pub fn build_tools(variant: Variant) -> Vec<ToolKind> {
    let mut tools = vec![
        ToolKind::ReadSpec,
        ToolKind::ReadName,
        ToolKind::ReadType,
        ToolKind::ReadInputSchema,
        ToolKind::ReadEssay,
        ToolKind::ReadEssayTasks,
        ToolKind::ReadParameters,
        ToolKind::ReadFunction,
        ToolKind::WriteDescription,
        ToolKind::WriteInputMaps,
        ToolKind::AppendInlineTask,
        ToolKind::EditTask,
        ToolKind::DeleteTask,
        ToolKind::WriteExampleInputs,
        ToolKind::WriteReadme,
    ];
    match variant {
        Variant::ScalarLeaf => {}
        Variant::VectorLeaf => tools.push(ToolKind::WriteVectorFields),
        Variant::ScalarBranch => tools.push(ToolKind::AppendPlaceholderTask),
        Variant::VectorBranch => {
            tools.push(ToolKind::AppendPlaceholderTask);
            tools.push(ToolKind::WriteVectorFields);
        }
    }
    tools
}

fn variant_guidance(variant: Variant) -> &'static str {
    match variant {
        Variant::ScalarLeaf => "Every task is an inline task that scores the input directly.",
        Variant::VectorLeaf => {
            "Every task is an inline task that ranks the items directly. Set output_length, and \
             input_split/input_merge where the input needs splitting, with write_vector_fields."
        }
        Variant::ScalarBranch => {
            "Delegate each substantial sub-evaluation to a placeholder task: a new sub-function \
             with its own unique name, specification, function type and input schema. Inline \
             tasks are fine for simple steps."
        }
        Variant::VectorBranch => {
            "Delegate each substantial sub-evaluation to a placeholder task: a new sub-function \
             with its own unique name, specification, function type and input schema. Inline \
             tasks are fine for simple steps. Set output_length, and input_split/input_merge \
             where the input needs splitting, with write_vector_fields."
        }
    }
}

/// The instruction for one build attempt.
pub fn build_instruction(
    state: &ArtifactState,
    variant: Variant,
    goal: BuildGoal<'_>,
    attempt: u32,
    reasons: &[String],
) -> String {
    let mut text = String::new();
    for (title, value) in [
        ("SPECIFICATION", &state.spec),
        ("ESSAY", &state.essay),
        ("TASK BREAKDOWN", &state.essay_tasks),
    ] {
        if let Some(value) = value {
            text.push_str(&format!("## {}\n{}\n\n", title, value));
        }
    }
    if let BuildGoal::Amend(instructions) = goal {
        text.push_str(&format!(
            "## AMENDMENT\n{}\nChange the existing function accordingly; read_function shows it.\n\n",
            instructions.trim()
        ));
    }
    let (min, max) = state.parameters.width_bounds();
    text.push_str(&format!(
        "## BUILD\nBuild the {} function `{}`. {} Declare between {} and {} tasks. \
         Provide example inputs that satisfy the input schema, and summarize the function \
         in README.md with write_readme.",
        variant.label(),
        state.display_name(),
        variant_guidance(variant),
        min,
        max
    ));
    if attempt > 1 {
        text.push_str(&format!(
            "\n\n## PREVIOUS ATTEMPT\nAttempt {} failed, reasons:",
            attempt - 1
        ));
        for reason in reasons {
            text.push_str(&format!("\n- {}", reason));
        }
    }
    text
}

/// The build-validate-submit loop for one node directory.
pub struct SubmitLoop<'a> {
    agent: &'a dyn Agent,
    dir: &'a Path,
    context: ToolContext,
    inbox: Inbox,
    validators: &'a ValidatorChain,
    persistence: &'a Persistence,
    max_attempts: u32,
    sessions: SessionStore,
}

impl<'a> SubmitLoop<'a> {
    pub fn new(
        agent: &'a dyn Agent,
        dir: &'a Path,
        context: ToolContext,
        inbox: Inbox,
        validators: &'a ValidatorChain,
        persistence: &'a Persistence,
    ) -> Self {
        Self {
            agent,
            dir,
            context,
            inbox,
            validators,
            persistence,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            sessions: SessionStore::new(dir),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Run attempts until the artifact validates and is pushed.
    #[instrument(skip_all, fields(node = %state.display_name()))]
    pub async fn run(
        &self,
        state: &mut ArtifactState,
        session: &mut AgentSession,
        goal: BuildGoal<'_>,
    ) -> Result<OwnerRepositoryCommit, OrchestratorError> {
        let variant = state
            .variant()
            .ok_or_else(|| anyhow!("cannot build {}: function type is not set", state.display_name()))?;
        let name = state
            .name
            .clone()
            .ok_or_else(|| anyhow!("cannot build: name is not set"))?;
        let message = match goal {
            BuildGoal::Create => format!("Build {}", name),
            BuildGoal::Amend(_) => format!("Amend {}", name),
        };

        let mut reasons: Vec<String> = Vec::new();
        for attempt in 1..=self.max_attempts {
            let instruction = format!(
                "{}{}",
                build_instruction(state, variant, goal, attempt, &reasons),
                self.inbox.drain_section()
            );
            let mut tools = ToolBox::new(state, self.dir, build_tools(variant), self.context.clone());
            let outcome = session
                .turn(self.agent, instruction, &mut tools, &self.context.events)
                .await;
            let rejected = tools.take_rejections();
            drop(tools);
            outcome?;
            save_artifact(self.dir, state)?;

            let mut failures = self.validators.run(self.dir, state).await;
            if read_readme(self.dir).is_none() {
                failures.push("README.md is missing or empty".to_string());
            }
            if failures.is_empty() {
                match self.persistence.commit_and_push(self.dir, &name, &message).await {
                    Ok(location) => {
                        session.mark_progress();
                        self.sessions.record(
                            session.handle().map(|h| h.as_str()),
                            "build",
                            "completed",
                        )?;
                        info!(attempt, %location, "build submitted");
                        self.context
                            .events
                            .log(format!("build submitted on attempt {}", attempt));
                        return Ok(location);
                    }
                    Err(err) => failures.push(format!("commit and push failed: {:#}", err)),
                }
            }

            warn!(attempt, failures = failures.len(), "build attempt failed");
            self.context.events.log(format!(
                "build attempt {} failed: {}",
                attempt,
                failures.join("; ")
            ));
            self.sessions.record(
                session.handle().map(|h| h.as_str()),
                "build",
                "failed",
            )?;
            reasons = failures;
            reasons.extend(rejected.into_iter().map(|r| format!("rejected {}", r)));
        }

        Err(OrchestratorError::AttemptsExhausted {
            attempts: self.max_attempts,
            reasons,
        })
    }
}
