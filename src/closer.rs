//! Rewires a parent once its children have converged.
//!
//! Every placeholder whose child is finalized (persisted, free of
//! placeholders of its own, and confirmed on the remote) becomes a reference
//! to the child's commit. The parent is re-persisted only if something
//! changed, so closing twice commits once.

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::artifact::ArtifactState;
use crate::artifact::store::{load_artifact, save_artifact};
use crate::errors::OrchestratorError;
use crate::event::EventSink;
use crate::persistence::Persistence;

pub struct Closer {
    workspace: PathBuf,
    persistence: Persistence,
    events: EventSink,
}

impl Closer {
    pub fn new(workspace: &Path, persistence: Persistence, events: EventSink) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            persistence,
            events,
        }
    }

    /// Resolve what can be resolved and return the rewritten task indices.
    #[instrument(skip_all, fields(node = %state.display_name()))]
    pub async fn close(
        &self,
        dir: &Path,
        state: &mut ArtifactState,
    ) -> Result<Vec<usize>, OrchestratorError> {
        let declared: Vec<(usize, String)> = state
            .placeholders()
            .map(|(index, spec)| (index, spec.name.clone()))
            .collect();

        let mut resolved = Vec::new();
        let mut names = Vec::new();
        for (index, name) in declared {
            let child_dir = self.workspace.join(&name);
            let child = match load_artifact(&child_dir) {
                Ok(Some(child)) => child,
                Ok(None) => {
                    debug!(child = %name, "no artifact yet");
                    continue;
                }
                Err(err) => {
                    warn!(child = %name, "unreadable artifact: {:#}", err);
                    continue;
                }
            };
            if child.has_placeholders() {
                debug!(child = %name, "child still has placeholders");
                continue;
            }
            let Some(location) = self.persistence.finalized(&child_dir).await? else {
                debug!(child = %name, "child is not finalized");
                continue;
            };
            if state.resolve_placeholder(index, &location) {
                info!(child = %name, index, %location, "resolved placeholder");
                self.events.log(format!("resolved {} -> {}", name, location));
                resolved.push(index);
                names.push(name);
            }
        }

        if resolved.is_empty() {
            return Ok(resolved);
        }
        save_artifact(dir, state)?;
        let parent = state
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cannot persist {}: name is not set", dir.display()))?;
        self.persistence
            .commit_and_push(dir, &parent, &format!("Resolve {}", names.join(", ")))
            .await?;
        Ok(resolved)
    }
}
