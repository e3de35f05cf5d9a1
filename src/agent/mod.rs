//! The agent backend: an opaque "run one generation step" capability.
//!
//! A turn receives an instruction and a [`ToolBox`] bound to the node's
//! state; everything the agent changes goes through the toolbox. Progress
//! is reported over a bounded notification channel and the turn resolves
//! to the session handle to resume next time.

pub mod claude;
#[cfg(test)]
pub mod scripted;
pub mod tools;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::event::EventSink;

pub use crate::errors::AgentError;
pub use claude::ClaudeCliAgent;
pub use tools::{ToolBox, ToolCall, ToolContext, ToolKind};

/// Capacity of the per-turn notification channel.
pub const NOTIFICATION_BUFFER: usize = 64;

/// Opaque backend session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle(pub String);

impl SessionHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub instruction: String,
    /// Session to resume; `None` starts fresh.
    pub session: Option<SessionHandle>,
}

/// Progress reported while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Free text from the agent.
    Text(String),
    /// A tool call and whether it was accepted.
    Tool { name: String, accepted: bool },
}

impl Notification {
    pub fn describe(&self) -> String {
        match self {
            Notification::Text(text) => text.lines().next().unwrap_or("").trim().to_string(),
            Notification::Tool { name, accepted: true } => format!("tool {}", name),
            Notification::Tool {
                name,
                accepted: false,
            } => format!("tool {} (rejected)", name),
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn run_turn(
        &self,
        request: TurnRequest,
        tools: &mut ToolBox<'_>,
        notifications: &mpsc::Sender<Notification>,
    ) -> Result<SessionHandle, AgentError>;
}

/// Run one turn, mirroring its notifications into `events` as log lines.
pub async fn run_turn_logged(
    agent: &dyn Agent,
    request: TurnRequest,
    tools: &mut ToolBox<'_>,
    events: &EventSink,
) -> Result<SessionHandle, AgentError> {
    let (tx, mut rx) = mpsc::channel::<Notification>(NOTIFICATION_BUFFER);
    let sink = events.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let line = notification.describe();
            if !line.is_empty() {
                tracing::debug!(target: "fnforge::agent", "{}", line);
                sink.log(line);
            }
        }
    });

    let result = agent.run_turn(request, tools, &tx).await;
    drop(tx);
    let _ = forwarder.await;
    result
}

/// Session continuity across the turns of one run.
///
/// A stored handle may have expired on the backend. Until some step of this
/// run has succeeded, an invalid-session failure is retried once from a
/// fresh session; afterwards it is fatal.
#[derive(Debug, Clone, Default)]
pub struct AgentSession {
    handle: Option<SessionHandle>,
    progressed: bool,
}

impl AgentSession {
    pub fn resume(handle: Option<SessionHandle>) -> Self {
        Self {
            handle,
            progressed: false,
        }
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    pub fn mark_progress(&mut self) {
        self.progressed = true;
    }

    pub async fn turn(
        &mut self,
        agent: &dyn Agent,
        instruction: String,
        tools: &mut ToolBox<'_>,
        events: &EventSink,
    ) -> Result<(), AgentError> {
        let request = TurnRequest {
            instruction: instruction.clone(),
            session: self.handle.clone(),
        };
        let handle = match run_turn_logged(agent, request, tools, events).await {
            Ok(handle) => handle,
            Err(AgentError::InvalidSession(stale)) if !self.progressed => {
                tracing::warn!(session = %stale, "session no longer valid, starting fresh");
                let request = TurnRequest {
                    instruction,
                    session: None,
                };
                run_turn_logged(agent, request, tools, events).await?
            }
            Err(err) => return Err(err),
        };
        self.handle = Some(handle);
        Ok(())
    }
}
