//! Deterministic agent for tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{Agent, AgentError, Notification, SessionHandle, ToolBox, ToolCall, ToolKind, TurnRequest};
use crate::artifact::ArtifactState;

type Responder = Box<
    dyn Fn(&TurnRequest, &ArtifactState, &[ToolKind]) -> Result<Vec<ToolCall>, AgentError>
        + Send
        + Sync,
>;

/// Answers each turn with tool calls chosen by a responder function.
pub struct ScriptedAgent {
    responder: Responder,
    requests: Mutex<Vec<TurnRequest>>,
    turns: AtomicUsize,
}

impl ScriptedAgent {
    pub fn from_fn(
        responder: impl Fn(&TurnRequest, &ArtifactState, &[ToolKind]) -> Result<Vec<ToolCall>, AgentError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
            turns: AtomicUsize::new(0),
        }
    }

    /// Play back fixed turns in order; once exhausted every turn is empty.
    pub fn from_calls(turns: Vec<Vec<ToolCall>>) -> Self {
        let queue = Mutex::new(VecDeque::from(turns));
        Self::from_fn(move |_, _, _| {
            Ok(queue
                .lock()
                .map(|mut q| q.pop_front().unwrap_or_default())
                .unwrap_or_default())
        })
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn turns(&self) -> usize {
        self.turns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn run_turn(
        &self,
        request: TurnRequest,
        tools: &mut ToolBox<'_>,
        notifications: &mpsc::Sender<Notification>,
    ) -> Result<SessionHandle, AgentError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let turn = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        let calls = (self.responder)(&request, tools.state(), tools.allowed())?;
        for call in calls {
            let accepted = tools.call(&call).await.is_ok();
            let _ = notifications
                .send(Notification::Tool {
                    name: call.name.clone(),
                    accepted,
                })
                .await;
        }
        Ok(SessionHandle(format!("scripted-{}", turn)))
    }
}

/// Answer whichever preparation-phase write tool is on offer with a
/// plausible value.
pub fn phase_calls(allowed: &[ToolKind], name: &str, function_type: &str) -> Vec<ToolCall> {
    allowed
        .iter()
        .filter_map(|kind| match kind {
            ToolKind::WriteSpec => Some(json!({"spec": "score how helpful an answer is"})),
            ToolKind::WriteName => Some(json!({"name": name})),
            ToolKind::WriteType => Some(json!({"function_type": function_type})),
            ToolKind::WriteInputSchema => Some(json!({"input_schema": {
                "type": "object",
                "properties": {"answer": {"type": "string"}},
                "required": ["answer"]
            }})),
            ToolKind::WriteEssay => Some(json!({"essay": "Helpful answers are correct and direct."})),
            ToolKind::WriteEssayTasks => Some(json!({"essay_tasks": "Check correctness, then directness."})),
            _ => None,
        }
        .map(|arguments| ToolCall::new(kind.name(), arguments)))
        .collect()
}

/// A complete single-task leaf build using whichever build tools are on
/// offer.
pub fn leaf_build_calls(allowed: &[ToolKind]) -> Vec<ToolCall> {
    [
        (ToolKind::WriteDescription, json!({"description": "Scores how helpful an answer is."})),
        (ToolKind::AppendInlineTask, json!({"body": {"prompt": "Is the answer helpful?"}})),
        (ToolKind::WriteVectorFields, json!({"output_length": 2})),
        (ToolKind::WriteExampleInputs, json!({"example_inputs": [{"answer": "42"}]})),
        (ToolKind::WriteReadme, json!({"content": "# answer scorer\n\nScores answers.\n"})),
    ]
    .into_iter()
    .filter(|(kind, _)| allowed.contains(kind))
    .map(|(kind, arguments)| ToolCall::new(kind.name(), arguments))
    .collect()
}
