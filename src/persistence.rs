//! Idempotent commit/push of node directories.
//!
//! A node counts as finalized only when its working tree is clean and its
//! HEAD commit is confirmed present on the remote host. Anything less means
//! "not finalized yet", never an error. A node is published as soon as its
//! repository exists on the remote.

use anyhow::{Context, Result, anyhow, bail};
use std::path::Path;
use std::sync::Arc;

use crate::artifact::OwnerRepositoryCommit;
use crate::artifact::store::ensure_gitignore;
use crate::remote::{RemoteHost, parse_owner_repo};
use crate::tracker::{CommitAuthor, GitTracker};

/// Read `origin` and HEAD of the repository at `dir` without contacting the
/// remote.
pub fn inspect(dir: &Path) -> Result<OwnerRepositoryCommit> {
    let tracker = GitTracker::open(dir)?;
    let url = tracker
        .origin_url()
        .ok_or_else(|| anyhow!("{} has no origin remote", dir.display()))?;
    let (owner, repository) =
        parse_owner_repo(&url).ok_or_else(|| anyhow!("Cannot parse owner/repository from {}", url))?;
    let commit = tracker
        .head_sha()
        .ok_or_else(|| anyhow!("{} has no commits", dir.display()))?;
    Ok(OwnerRepositoryCommit {
        owner,
        repository,
        commit,
    })
}

#[derive(Clone)]
pub struct Persistence {
    remote: Arc<dyn RemoteHost>,
    author: CommitAuthor,
}

impl Persistence {
    pub fn new(remote: Arc<dyn RemoteHost>, author: CommitAuthor) -> Self {
        Self { remote, author }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteHost> {
        &self.remote
    }

    /// True if `dir` has changes that were never committed. A directory that
    /// is not yet a repository is dirty.
    pub fn is_dirty(&self, dir: &Path) -> Result<bool> {
        if !dir.join(".git").exists() {
            return Ok(true);
        }
        GitTracker::open(dir)?.is_dirty()
    }

    /// Commit everything in `dir` and push it to the repository `name`,
    /// creating the repository on first push. Returns the confirmed location.
    pub async fn commit_and_push(
        &self,
        dir: &Path,
        name: &str,
        message: &str,
    ) -> Result<OwnerRepositoryCommit> {
        ensure_gitignore(dir)?;
        let tracker = GitTracker::open_or_init(dir)?.with_author(self.author.clone());

        if tracker.head_sha().is_none() || tracker.is_dirty()? {
            let sha = tracker.commit_all(message)?;
            tracing::info!(dir = %dir.display(), %sha, "committed");
        }

        if tracker.origin_url().is_none() {
            if !self.remote.repository_exists(name).await? {
                self.remote
                    .create_repository(name, None)
                    .await
                    .with_context(|| format!("Failed to create remote repository {}", name))?;
            }
            tracker.set_origin(&self.remote.clone_url(name))?;
        }

        tracker.push(self.remote.push_token())?;

        let location = inspect(dir)?;
        if !self
            .remote
            .remote_commit_exists(&location.owner, &location.repository, &location.commit)
            .await?
        {
            bail!("Pushed {} but the remote does not report it yet", location);
        }
        tracing::info!(%location, "pushed");
        Ok(location)
    }

    /// The node's confirmed location, or `None` if it is not finalized.
    pub async fn finalized(&self, dir: &Path) -> Result<Option<OwnerRepositoryCommit>> {
        if self.is_dirty(dir)? {
            return Ok(None);
        }
        let Ok(location) = inspect(dir) else {
            return Ok(None);
        };
        let present = self
            .remote
            .remote_commit_exists(&location.owner, &location.repository, &location.commit)
            .await?;
        Ok(present.then_some(location))
    }

    /// The node's recorded location if its repository exists on the remote,
    /// whatever the state of its working tree. `origin` is only set once a
    /// node passed validation, so a published node is never stale: later
    /// edits get committed and pushed, not thrown away.
    pub async fn published(&self, dir: &Path) -> Result<Option<OwnerRepositoryCommit>> {
        if !dir.join(".git").exists() {
            return Ok(None);
        }
        let Ok(location) = inspect(dir) else {
            return Ok(None);
        };
        let exists = self.remote.repository_exists(&location.repository).await?;
        Ok(exists.then_some(location))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::LocalRemote;
    use std::fs;
    use tempfile::tempdir;

    fn persistence(root: &Path) -> Persistence {
        Persistence::new(
            Arc::new(LocalRemote::new(root, "local")),
            CommitAuthor::default(),
        )
    }

    #[tokio::test]
    async fn test_commit_and_push_creates_repository() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let persistence = persistence(root.path());
        fs::write(work.path().join("artifact.json"), "{}").unwrap();

        assert!(persistence.is_dirty(work.path()).unwrap());
        assert!(persistence.finalized(work.path()).await.unwrap().is_none());

        let location = persistence
            .commit_and_push(work.path(), "scorer", "initial")
            .await
            .unwrap();
        assert_eq!(location.owner, "local");
        assert_eq!(location.repository, "scorer");
        assert!(!persistence.is_dirty(work.path()).unwrap());
        assert_eq!(persistence.finalized(work.path()).await.unwrap(), Some(location));
    }

    #[tokio::test]
    async fn test_second_push_without_changes_keeps_commit() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let persistence = persistence(root.path());
        fs::write(work.path().join("artifact.json"), "{}").unwrap();
        let first = persistence
            .commit_and_push(work.path(), "scorer", "initial")
            .await
            .unwrap();
        let second = persistence
            .commit_and_push(work.path(), "scorer", "again")
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_local_edits_are_not_finalized() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let persistence = persistence(root.path());
        fs::write(work.path().join("artifact.json"), "{}").unwrap();
        persistence
            .commit_and_push(work.path(), "scorer", "initial")
            .await
            .unwrap();
        fs::write(work.path().join("artifact.json"), "{\"name\":\"x\"}").unwrap();
        assert!(persistence.finalized(work.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpushed_commit_is_not_finalized() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let persistence = persistence(root.path());
        fs::write(work.path().join("artifact.json"), "{}").unwrap();
        persistence
            .commit_and_push(work.path(), "scorer", "initial")
            .await
            .unwrap();

        fs::write(work.path().join("README.md"), "# scorer\n").unwrap();
        GitTracker::open(work.path())
            .unwrap()
            .commit_all("local only")
            .unwrap();
        assert!(persistence.finalized(work.path()).await.unwrap().is_none());
    }

    #[test]
    fn test_inspect_requires_origin() {
        let work = tempdir().unwrap();
        let tracker = GitTracker::open_or_init(work.path()).unwrap();
        fs::write(work.path().join("a"), "a").unwrap();
        tracker.commit_all("c").unwrap();
        let err = inspect(work.path()).unwrap_err();
        assert!(err.to_string().contains("no origin"));
    }

    #[tokio::test]
    async fn test_commit_writes_gitignore_for_state_dir() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let persistence = persistence(root.path());
        fs::create_dir_all(work.path().join(".fnforge")).unwrap();
        fs::write(work.path().join(".fnforge/session.json"), "{}").unwrap();
        fs::write(work.path().join("artifact.json"), "{}").unwrap();
        persistence
            .commit_and_push(work.path(), "scorer", "initial")
            .await
            .unwrap();
        fs::write(work.path().join(".fnforge/session.json"), "{\"x\":1}").unwrap();
        assert!(!persistence.is_dirty(work.path()).unwrap());
    }

    #[tokio::test]
    async fn test_dirty_pushed_node_is_published_but_not_finalized() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let persistence = persistence(root.path());
        fs::write(work.path().join("artifact.json"), "{}").unwrap();
        assert!(persistence.published(work.path()).await.unwrap().is_none());

        let location = persistence
            .commit_and_push(work.path(), "scorer", "initial")
            .await
            .unwrap();
        fs::write(work.path().join("NOTES.md"), "draft").unwrap();

        assert!(persistence.finalized(work.path()).await.unwrap().is_none());
        assert_eq!(persistence.published(work.path()).await.unwrap(), Some(location));
    }
}
