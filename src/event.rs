//! Line-delimited, path-addressed event protocol.
//!
//! Every process in a function tree writes its events to stdout, one JSON
//! object per line. A parent process reads its children's stdout, prefixes
//! each event's `path` with the child's name and re-emits it, so the root's
//! stdout carries the whole tree:
//!
//! ```text
//! {"type":"start","path":"ranker"}
//! {"type":"name","path":"ranker/scorer-a","name":"scorer-a"}
//! {"type":"log","path":"ranker/scorer-a","line":"phase essay complete"}
//! {"type":"done","path":"ranker"}
//! ```
//!
//! Parsing is total: child stdout may interleave incidental output, so any
//! line that is not a well-formed event is dropped.

use serde::{Deserialize, Serialize};
use std::io::Write;
use tokio::sync::mpsc;

/// One observable step in the life of a tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The node at `path` has started.
    Start { path: String },
    /// The node at `path` claimed `name`.
    Name { path: String, name: String },
    /// A human-readable progress line.
    Log { path: String, line: String },
    /// The node at `path` finished, successfully or not.
    Done { path: String },
}

impl AgentEvent {
    pub fn path(&self) -> &str {
        match self {
            AgentEvent::Start { path }
            | AgentEvent::Name { path, .. }
            | AgentEvent::Log { path, .. }
            | AgentEvent::Done { path } => path,
        }
    }

    fn path_mut(&mut self) -> &mut String {
        match self {
            AgentEvent::Start { path }
            | AgentEvent::Name { path, .. }
            | AgentEvent::Log { path, .. }
            | AgentEvent::Done { path } => path,
        }
    }

    pub fn log(line: impl Into<String>) -> Self {
        AgentEvent::Log {
            path: String::new(),
            line: line.into(),
        }
    }
}

/// Serialize an event as a single protocol line (no trailing newline).
pub fn serialize(event: &AgentEvent) -> String {
    // serde_json escapes embedded newlines, so the output is always one line.
    serde_json::to_string(event).unwrap_or_default()
}

/// Parse one protocol line. Anything that is not a known event yields `None`.
pub fn parse(line: &str) -> Option<AgentEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Re-address an event one level up the tree.
pub fn prefix(mut event: AgentEvent, segment: &str) -> AgentEvent {
    let path = event.path_mut();
    if path.is_empty() {
        *path = segment.to_string();
    } else {
        *path = format!("{}/{}", segment, path);
    }
    event
}

/// Human-readable form of an event, for operators watching a tree.
pub fn render(event: &AgentEvent) -> String {
    let path = match event.path() {
        "" => "<root>",
        path => path,
    };
    match event {
        AgentEvent::Start { .. } => format!("[{}] started", path),
        AgentEvent::Name { name, .. } => format!("[{}] named {}", path, name),
        AgentEvent::Log { line, .. } => {
            let indent = " ".repeat(path.len() + 3);
            format!("[{}] {}", path, line.replace('\n', &format!("\n{}", indent)))
        }
        AgentEvent::Done { .. } => format!("[{}] done", path),
    }
}

/// Accumulates raw output chunks and yields complete lines.
///
/// The trailing partial line is retained across calls to [`LineBuffer::push`]
/// and handed out by [`LineBuffer::finish`] once the stream closes.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Cloneable sending side of a node's event stream.
///
/// A sink may be scoped below the process's own node: a subtree resumed
/// in-process emits through `events.scoped(name)` so its events keep their
/// position in the tree.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
    scope: String,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                scope: String::new(),
            },
            rx,
        )
    }

    /// A sink whose events are discarded.
    pub fn detached() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    /// A sink for the node `segment` below this one.
    pub fn scoped(&self, segment: &str) -> Self {
        Self {
            tx: self.tx.clone(),
            scope: self.child_path(segment),
        }
    }

    /// Path of this sink's node relative to the process's own node.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Path of the child `name` relative to the process's own node.
    pub fn child_path(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.scope, name)
        }
    }

    pub fn emit(&self, event: AgentEvent) {
        let event = if self.scope.is_empty() {
            event
        } else {
            prefix(event, &self.scope)
        };
        // The receiver only disappears during shutdown.
        let _ = self.tx.send(event);
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(AgentEvent::log(line));
    }

    pub fn name(&self, name: &str) {
        self.emit(AgentEvent::Name {
            path: String::new(),
            name: name.to_string(),
        });
    }
}

/// Drain events to stdout, one line each, until every sink is dropped.
pub async fn write_to_stdout(mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        let mut stdout = std::io::stdout().lock();
        // Parent may have gone away; keep draining so senders never block.
        let _ = writeln!(stdout, "{}", serialize(&event)).and_then(|_| stdout.flush());
    }
}
