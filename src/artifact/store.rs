//! On-disk layout of a node directory.
//!
//! ```text
//! <dir>/artifact.json            artifact state (committed)
//! <dir>/README.md                human summary (committed)
//! <dir>/.gitignore               ignores .fnforge/
//! <dir>/.fnforge/session.json    agent session handle + phase history
//! <dir>/.fnforge/logs/           tracing output of the node's process
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::ArtifactState;

pub const ARTIFACT_FILE: &str = "artifact.json";
pub const README_FILE: &str = "README.md";
pub const STATE_DIR: &str = ".fnforge";
pub const SESSION_FILE: &str = "session.json";
pub const LOG_DIR: &str = "logs";

pub fn artifact_path(dir: &Path) -> PathBuf {
    dir.join(ARTIFACT_FILE)
}

pub fn readme_path(dir: &Path) -> PathBuf {
    dir.join(README_FILE)
}

pub fn state_dir(dir: &Path) -> PathBuf {
    dir.join(STATE_DIR)
}

pub fn log_dir(dir: &Path) -> PathBuf {
    state_dir(dir).join(LOG_DIR)
}

/// Load `artifact.json`. A missing file is `Ok(None)`; a file that fails to
/// parse is an error.
pub fn load_artifact(dir: &Path) -> Result<Option<ArtifactState>> {
    let path = artifact_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut state: ArtifactState = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    state.parameters = state.parameters.normalized();
    Ok(Some(state))
}

pub fn save_artifact(dir: &Path, state: &ArtifactState) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = artifact_path(dir);
    let content = serde_json::to_string_pretty(state).context("Failed to serialize artifact")?;
    fs::write(&path, format!("{}\n", content))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Read the README summary, treating whitespace-only content as absent.
pub fn read_readme(dir: &Path) -> Option<String> {
    fs::read_to_string(readme_path(dir))
        .ok()
        .filter(|content| !content.trim().is_empty())
}

pub fn write_readme(dir: &Path, content: &str) -> Result<()> {
    let path = readme_path(dir);
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Make sure the node's private state never ends up in a commit.
pub fn ensure_gitignore(dir: &Path) -> Result<()> {
    let path = dir.join(".gitignore");
    let entry = format!("{}/", STATE_DIR);
    let existing = fs::read_to_string(&path).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }
    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&entry);
    content.push('\n');
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// One completed phase or build attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub step: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted agent session for a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub history: Vec<SessionEntry>,
}

impl SessionRecord {
    pub fn last_completed(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|entry| entry.status == "completed")
            .map(|entry| entry.step.as_str())
    }
}

/// Reads and writes `<dir>/.fnforge/session.json`.
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: state_dir(dir).join(SESSION_FILE),
        }
    }

    pub fn load(&self) -> Result<SessionRecord> {
        if !self.path.exists() {
            return Ok(SessionRecord::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    /// Record a completed step together with the current session handle.
    pub fn record(&self, session_id: Option<&str>, step: &str, status: &str) -> Result<()> {
        let mut record = self.load().unwrap_or_default();
        record.session_id = session_id.map(str::to_string);
        record.history.push(SessionEntry {
            step: step.to_string(),
            status: status.to_string(),
            timestamp: Utc::now(),
        });
        self.write(&record)
    }

    fn write(&self, record: &SessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        let content = serde_json::to_string_pretty(record).context("Failed to serialize session")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}
