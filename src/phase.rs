//! The preparation phases that run before a node's function is built.
//!
//! Phases run in a fixed order and each one owns exactly one artifact field.
//! A phase whose field is already set is skipped, which is what makes a
//! crashed node resumable: re-running the pipeline only fills the gaps.

use std::fmt;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use crate::agent::{Agent, AgentSession, ToolBox, ToolContext, ToolKind};
use crate::artifact::ArtifactState;
use crate::artifact::store::{SessionStore, save_artifact};
use crate::errors::OrchestratorError;
use crate::inbox::Inbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    Spec,
    Name,
    Type,
    InputSchema,
    Essay,
    EssayTasks,
}

impl PhaseKind {
    pub const ORDER: [PhaseKind; 6] = [
        PhaseKind::Spec,
        PhaseKind::Name,
        PhaseKind::Type,
        PhaseKind::InputSchema,
        PhaseKind::Essay,
        PhaseKind::EssayTasks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Spec => "spec",
            PhaseKind::Name => "name",
            PhaseKind::Type => "type",
            PhaseKind::InputSchema => "input_schema",
            PhaseKind::Essay => "essay",
            PhaseKind::EssayTasks => "essay_tasks",
        }
    }

    /// Agent turns allowed before the phase gives up.
    pub fn max_attempts(self) -> u32 {
        match self {
            PhaseKind::Name => 10,
            PhaseKind::InputSchema => 5,
            PhaseKind::Spec | PhaseKind::Type | PhaseKind::Essay | PhaseKind::EssayTasks => 3,
        }
    }

    pub fn write_tool(self) -> ToolKind {
        match self {
            PhaseKind::Spec => ToolKind::WriteSpec,
            PhaseKind::Name => ToolKind::WriteName,
            PhaseKind::Type => ToolKind::WriteType,
            PhaseKind::InputSchema => ToolKind::WriteInputSchema,
            PhaseKind::Essay => ToolKind::WriteEssay,
            PhaseKind::EssayTasks => ToolKind::WriteEssayTasks,
        }
    }

    fn read_tool(self) -> ToolKind {
        match self {
            PhaseKind::Spec => ToolKind::ReadSpec,
            PhaseKind::Name => ToolKind::ReadName,
            PhaseKind::Type => ToolKind::ReadType,
            PhaseKind::InputSchema => ToolKind::ReadInputSchema,
            PhaseKind::Essay => ToolKind::ReadEssay,
            PhaseKind::EssayTasks => ToolKind::ReadEssayTasks,
        }
    }

    /// Read tools for every earlier phase, the parameters, and this phase's
    /// single write tool.
    pub fn tools(self) -> Vec<ToolKind> {
        let mut tools: Vec<ToolKind> = Self::ORDER
            .iter()
            .take_while(|p| **p != self)
            .map(|p| p.read_tool())
            .collect();
        tools.push(ToolKind::ReadParameters);
        tools.push(self.write_tool());
        tools
    }

    pub fn is_complete(self, state: &ArtifactState) -> bool {
        match self {
            PhaseKind::Spec => state.spec.is_some(),
            PhaseKind::Name => state.name.is_some(),
            PhaseKind::Type => state.function_type.is_some(),
            PhaseKind::InputSchema => state.function.input_schema.is_some(),
            PhaseKind::Essay => state.essay.is_some(),
            PhaseKind::EssayTasks => state.essay_tasks.is_some(),
        }
    }

    fn task(self, state: &ArtifactState) -> String {
        match self {
            PhaseKind::Spec => "Write the specification of the quality function to build: what it \
                 evaluates, what its input looks like and what a good result means."
                .to_string(),
            PhaseKind::Name => "Choose a short, descriptive name for this function: lowercase words \
                 joined by single dashes. The name must not be taken already; if it is, pick \
                 another one."
                .to_string(),
            PhaseKind::Type => "Decide the function type: \"scalar\" if it scores a single item, \
                 \"vector\" if it ranks a collection of items."
                .to_string(),
            PhaseKind::InputSchema => {
                "Write the JSON schema describing this function's input.".to_string()
            }
            PhaseKind::Essay => "Write an essay on how to judge quality for this function: the \
                 criteria that matter, how to weigh them and the common failure modes."
                .to_string(),
            PhaseKind::EssayTasks => {
                let (min, max) = state.parameters.width_bounds();
                let shape = if state.parameters.is_leaf() {
                    "Each task is a single self-contained evaluation step."
                } else {
                    "Each task may become a sub-function of its own, built separately."
                };
                format!(
                    "Write an essay that breaks the evaluation into between {} and {} tasks. {}",
                    min, max, shape
                )
            }
        }
    }

    /// The instruction for one attempt. Later attempts carry the previous
    /// attempt's rejected tool calls.
    pub fn instruction(self, state: &ArtifactState, attempt: u32, rejections: &[String]) -> String {
        let mut text = String::new();
        if self != PhaseKind::Spec
            && let Some(spec) = &state.spec
        {
            text.push_str(&format!("## SPECIFICATION\n{}\n\n", spec));
        }
        text.push_str(&format!(
            "## STEP: {}\n{}\nRecord the result with {}.",
            self,
            self.task(state),
            self.write_tool().name()
        ));
        if attempt > 1 {
            text.push_str(&format!(
                "\n\n## PREVIOUS ATTEMPT\nAttempt {} did not record a {}.",
                attempt - 1,
                self
            ));
            for rejection in rejections {
                text.push_str(&format!("\n- rejected {}", rejection));
            }
        }
        text
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives the phase pipeline for one node directory.
pub struct PhaseRunner<'a> {
    agent: &'a dyn Agent,
    dir: &'a Path,
    context: ToolContext,
    inbox: Inbox,
    sessions: SessionStore,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(agent: &'a dyn Agent, dir: &'a Path, context: ToolContext, inbox: Inbox) -> Self {
        Self {
            agent,
            dir,
            context,
            inbox,
            sessions: SessionStore::new(dir),
        }
    }

    pub async fn run_all(
        &self,
        state: &mut ArtifactState,
        session: &mut AgentSession,
    ) -> Result<(), OrchestratorError> {
        for phase in PhaseKind::ORDER {
            self.run(phase, state, session).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(phase = %phase, node = %state.display_name()))]
    pub async fn run(
        &self,
        phase: PhaseKind,
        state: &mut ArtifactState,
        session: &mut AgentSession,
    ) -> Result<(), OrchestratorError> {
        if phase.is_complete(state) {
            debug!("already complete");
            return Ok(());
        }

        let attempts = phase.max_attempts();
        let mut rejections = Vec::new();
        for attempt in 1..=attempts {
            let instruction = format!(
                "{}{}",
                phase.instruction(state, attempt, &rejections),
                self.inbox.drain_section()
            );
            let mut tools = ToolBox::new(state, self.dir, phase.tools(), self.context.clone());
            let outcome = session
                .turn(self.agent, instruction, &mut tools, &self.context.events)
                .await;
            rejections = tools.take_rejections();
            drop(tools);
            outcome?;

            save_artifact(self.dir, state)?;
            if phase.is_complete(state) {
                session.mark_progress();
                self.sessions.record(
                    session.handle().map(|h| h.as_str()),
                    phase.as_str(),
                    "completed",
                )?;
                info!(attempt, "phase complete");
                self.context.events.log(format!("phase {} complete", phase));
                return Ok(());
            }
            warn!(attempt, rejected = rejections.len(), "phase produced no output");
        }

        self.context
            .events
            .log(format!("phase {} failed after {} attempts", phase, attempts));
        Err(OrchestratorError::PhaseNoOutput { phase, attempts })
    }
}
