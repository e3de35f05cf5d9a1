//! Typed error hierarchy for fnforge.
//!
//! Two enums cover the two failure domains:
//! - `AgentError`: failures talking to the agent backend
//! - `OrchestratorError`: everything that aborts driving a tree node

use thiserror::Error;

use crate::phase::PhaseKind;

/// Errors from a single agent turn.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The backend rejected the session handle we tried to resume.
    #[error("Agent session is no longer valid: {0}")]
    InvalidSession(String),

    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Agent exited with code {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that abort the orchestration of one node (and its subtree).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Phase {phase} produced no output after {attempts} attempts")]
    PhaseNoOutput { phase: PhaseKind, attempts: u32 },

    #[error("Build failed after {attempts} attempts: {}", .reasons.join("; "))]
    AttemptsExhausted { attempts: u32, reasons: Vec<String> },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Child '{name}' failed: {error}")]
    ChildFailed { name: String, error: String },

    #[error("{} child failures:\n{}", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<OrchestratorError>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Collapse collected child errors: none is `Ok`, one is re-raised as
    /// itself, several become an `Aggregate`.
    pub fn collect(mut errors: Vec<OrchestratorError>) -> Result<(), OrchestratorError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(OrchestratorError::Aggregate(errors)),
        }
    }
}

fn format_aggregate(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
