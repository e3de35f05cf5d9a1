//! Inbound operator messages.
//!
//! Messages arrive on stdin as JSON lines `{"path": "a/b", "message": "..."}`.
//! An empty path addresses the receiving node: the message is queued and
//! appended to that node's next agent instruction. Any other path is handed
//! to the relay, which forwards it to the deepest running child on the path.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub path: String,
    pub message: String,
}

impl InboundMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// The message re-addressed relative to the node at `path`, if it is
    /// addressed to that node or below it.
    pub fn below(&self, path: &str) -> Option<InboundMessage> {
        let rest = if self.path == path {
            ""
        } else {
            self.path.strip_prefix(path)?.strip_prefix('/')?
        };
        Some(InboundMessage {
            path: rest.to_string(),
            message: self.message.clone(),
        })
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Messages queued for this node's next agent instruction.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    queue: Arc<Mutex<VecDeque<String>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(message.into());
        }
    }

    pub fn drain(&self) -> Vec<String> {
        self.queue
            .lock()
            .map(|mut queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drain queued messages into an instruction section; empty if none.
    pub fn drain_section(&self) -> String {
        let messages = self.drain();
        if messages.is_empty() {
            return String::new();
        }
        let lines: Vec<String> = messages.iter().map(|m| format!("- {}", m)).collect();
        format!("\n\n## OPERATOR MESSAGES\n{}", lines.join("\n"))
    }
}

/// Read operator messages from `input` until EOF. Messages for this node go
/// to `inbox`; the rest are returned on the channel for the spawner.
pub fn spawn_reader<R>(input: R, inbox: Inbox) -> mpsc::UnboundedReceiver<InboundMessage>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(message) = InboundMessage::parse(&line) else {
                tracing::debug!(%line, "ignoring malformed operator message");
                continue;
            };
            if message.path.is_empty() {
                tracing::info!("queued operator message");
                inbox.push(message.message);
            } else if tx.send(message).is_err() {
                break;
            }
        }
    });
    rx
}
