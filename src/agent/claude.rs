//! Agent backend driving the `claude` CLI in stream-json mode.
//!
//! The CLI runs one prompt per invocation. Tool calls are requested in the
//! assistant's text as
//!
//! ```text
//! <tool_call>{"name": "write_spec", "arguments": {"spec": "..."}}</tool_call>
//! ```
//!
//! After each invocation the calls are executed against the [`ToolBox`] and
//! their results are sent back in a resumed invocation, until the agent
//! answers without calling any tool.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::supervisor::LiveProcesses;

use super::{Agent, AgentError, Notification, SessionHandle, ToolBox, ToolCall, TurnRequest};

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";
/// Upper bound on invoke → execute → report round trips within one turn.
const DEFAULT_MAX_ROUNDS: u32 = 8;

/// Events from Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// What one CLI invocation produced.
#[derive(Debug, Default)]
struct InvocationOutput {
    session_id: Option<String>,
    text: String,
}

pub struct ClaudeCliAgent {
    claude_cmd: String,
    working_dir: PathBuf,
    skip_permissions: bool,
    model: Option<String>,
    max_rounds: u32,
    live: Option<LiveProcesses>,
}

impl ClaudeCliAgent {
    pub fn new(claude_cmd: impl Into<String>, working_dir: &Path) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            working_dir: working_dir.to_path_buf(),
            skip_permissions: true,
            model: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            live: None,
        }
    }

    /// Register each running CLI process group in `live`, so a shutdown
    /// that kills `live` takes the agent down too.
    pub fn with_live(mut self, live: LiveProcesses) -> Self {
        self.live = Some(live);
        self
    }

    pub fn with_skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    fn flags(&self, session: Option<&SessionHandle>) -> Vec<String> {
        let mut flags = Vec::new();
        if self.skip_permissions {
            flags.push("--dangerously-skip-permissions".to_string());
        }
        flags.push("--print".to_string());
        flags.push("--output-format".to_string());
        flags.push("stream-json".to_string());
        flags.push("--verbose".to_string());
        if let Some(model) = &self.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if let Some(session) = session {
            flags.push("--resume".to_string());
            flags.push(session.as_str().to_string());
        }
        flags
    }

    async fn invoke(
        &self,
        prompt: &str,
        session: Option<&SessionHandle>,
        notifications: &mpsc::Sender<Notification>,
    ) -> Result<InvocationOutput, AgentError> {
        let flags = self.flags(session);
        tracing::debug!(cmd = %self.claude_cmd, flags = %flags.join(" "), "spawning agent");

        let mut command = Command::new(&self.claude_cmd);
        command
            .args(&flags)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(AgentError::Spawn)?;
        let _group = match (&self.live, child.id()) {
            (Some(live), Some(pid)) => Some(live.track(pid)),
            _ => None,
        };

        // Write prompt to stdin and close it
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to write prompt to agent stdin: {}", e))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to close agent stdin: {}", e))?;
        }

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to capture agent stdout"))?;
        let mut reader = BufReader::new(stdout).lines();

        let mut output = InvocationOutput::default();
        let mut error_result: Option<String> = None;

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read agent output: {}", e))?
        {
            if line.trim().is_empty() {
                continue;
            }
            // Non-JSON lines are incidental CLI output.
            let Ok(event) = serde_json::from_str::<StreamEvent>(&line) else {
                continue;
            };
            match event {
                StreamEvent::Assistant {
                    message,
                    session_id,
                } => {
                    if session_id.is_some() {
                        output.session_id = session_id;
                    }
                    for block in message.content {
                        if let ContentBlock::Text { text } = block {
                            output.text.push_str(&text);
                            output.text.push('\n');
                            let _ = notifications.send(Notification::Text(text)).await;
                        }
                    }
                }
                StreamEvent::Result {
                    result,
                    is_error,
                    session_id,
                } => {
                    if session_id.is_some() {
                        output.session_id = session_id;
                    }
                    if is_error {
                        error_result = Some(result.unwrap_or_default());
                    }
                }
                StreamEvent::System { session_id } => {
                    if session_id.is_some() {
                        output.session_id = session_id;
                    }
                }
                StreamEvent::Other => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to wait for agent: {}", e))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if session.is_some() && is_invalid_session(error_result.as_deref().unwrap_or(""), &stderr) {
            return Err(AgentError::InvalidSession(
                session.map(|s| s.0.clone()).unwrap_or_default(),
            ));
        }
        if !status.success() || error_result.is_some() {
            let detail = match error_result {
                Some(result) if !result.trim().is_empty() => result,
                _ => stderr.trim().to_string(),
            };
            return Err(AgentError::Failed {
                exit_code: status.code(),
                stderr: detail,
            });
        }
        Ok(output)
    }
}

fn is_invalid_session(result: &str, stderr: &str) -> bool {
    [result, stderr].iter().any(|text| {
        let lower = text.to_lowercase();
        lower.contains("no conversation found") || lower.contains("invalid session")
    })
}

/// Compose the first prompt of a turn: the instruction plus the tool
/// protocol.
pub fn build_prompt(instruction: &str, tools: &ToolBox<'_>) -> String {
    format!(
        r#"{}

## TOOLS
You change the function only through these tools:
{}

To call a tool, write a block like this in your reply (one block per call):
{}{{"name": "<tool>", "arguments": {{...}}}}{}

Tool results are sent back to you. Reply without any tool call when you are finished."#,
        instruction.trim_end(),
        tools.describe(),
        TOOL_CALL_OPEN,
        TOOL_CALL_CLOSE
    )
}

/// Extract every `<tool_call>` block from agent text. Malformed blocks are
/// returned as errors so they can be reported back.
pub fn extract_tool_calls(text: &str) -> Vec<Result<ToolCall, String>> {
    let mut calls = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(TOOL_CALL_OPEN) {
        let after = &rest[start + TOOL_CALL_OPEN.len()..];
        let Some(end) = after.find(TOOL_CALL_CLOSE) else {
            calls.push(Err("unterminated <tool_call> block".to_string()));
            break;
        };
        let body = after[..end].trim();
        calls.push(
            serde_json::from_str::<ToolCall>(body)
                .map_err(|e| format!("malformed tool call: {}", e)),
        );
        rest = &after[end + TOOL_CALL_CLOSE.len()..];
    }
    calls
}

#[async_trait]
impl Agent for ClaudeCliAgent {
    async fn run_turn(
        &self,
        request: TurnRequest,
        tools: &mut ToolBox<'_>,
        notifications: &mpsc::Sender<Notification>,
    ) -> Result<SessionHandle, AgentError> {
        let mut session = request.session.clone();
        let mut prompt = build_prompt(&request.instruction, tools);

        for round in 1..=self.max_rounds {
            let output = self.invoke(&prompt, session.as_ref(), notifications).await?;
            if let Some(id) = output.session_id {
                session = Some(SessionHandle(id));
            }

            let calls = extract_tool_calls(&output.text);
            if calls.is_empty() {
                break;
            }
            tracing::debug!(round, count = calls.len(), "executing tool calls");

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                let line = match call {
                    Ok(call) => {
                        let result = tools.call(&call).await;
                        let _ = notifications
                            .send(Notification::Tool {
                                name: call.name.clone(),
                                accepted: result.is_ok(),
                            })
                            .await;
                        match result {
                            Ok(value) => format!("{}: ok {}", call.name, value),
                            Err(reason) => format!("{}: rejected: {}", call.name, reason),
                        }
                    }
                    Err(reason) => reason,
                };
                results.push(format!("- {}", line));
            }
            prompt = format!(
                "Tool results:\n{}\n\nContinue. Call more tools if needed, or reply without tool calls when finished.",
                results.join("\n")
            );
        }

        session.ok_or_else(|| AgentError::Failed {
            exit_code: Some(0),
            stderr: "agent did not report a session id".to_string(),
        })
    }
}
