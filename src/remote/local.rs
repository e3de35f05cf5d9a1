use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{Oid, Repository};
use std::path::{Path, PathBuf};

use super::RemoteHost;

/// Bare repositories laid out as `<root>/<owner>/<name>.git`.
///
/// Behaves like a hosting service for offline runs and tests: repositories
/// must be created before they can be pushed to, and commits count as
/// present only once pushed.
pub struct LocalRemote {
    root: PathBuf,
    owner: String,
}

impl LocalRemote {
    pub fn new(root: &Path, owner: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            owner: owner.to_string(),
        }
    }

    pub fn repository_path(&self, owner: &str, name: &str) -> PathBuf {
        self.root.join(owner).join(format!("{}.git", name))
    }
}

#[async_trait]
impl RemoteHost for LocalRemote {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn repository_exists(&self, name: &str) -> Result<bool> {
        Ok(self.repository_path(&self.owner, name).join("HEAD").exists())
    }

    async fn remote_commit_exists(&self, owner: &str, repository: &str, commit: &str) -> Result<bool> {
        let path = self.repository_path(owner, repository);
        let Ok(repo) = Repository::open_bare(&path) else {
            return Ok(false);
        };
        let Ok(oid) = Oid::from_str(commit) else {
            return Ok(false);
        };
        Ok(repo.find_commit(oid).is_ok())
    }

    async fn create_repository(&self, name: &str, _description: Option<&str>) -> Result<()> {
        let path = self.repository_path(&self.owner, name);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Repository::init_bare(&path)
            .with_context(|| format!("Failed to init bare repository at {}", path.display()))?;
        tracing::info!(path = %path.display(), "created local repository");
        Ok(())
    }

    fn clone_url(&self, name: &str) -> String {
        self.repository_path(&self.owner, name)
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::parse_owner_repo;
    use crate::tracker::GitTracker;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_then_exists() {
        let root = tempdir().unwrap();
        let remote = LocalRemote::new(root.path(), "local");
        assert!(!remote.repository_exists("scorer").await.unwrap());
        remote.create_repository("scorer", None).await.unwrap();
        assert!(remote.repository_exists("scorer").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_visible_only_after_push() {
        let root = tempdir().unwrap();
        let work = tempdir().unwrap();
        let remote = LocalRemote::new(root.path(), "local");
        remote.create_repository("scorer", None).await.unwrap();

        let tracker = GitTracker::open_or_init(work.path()).unwrap();
        std::fs::write(work.path().join("a.txt"), "a").unwrap();
        let sha = tracker.commit_all("init").unwrap();
        assert!(!remote.remote_commit_exists("local", "scorer", &sha).await.unwrap());

        tracker.set_origin(&remote.clone_url("scorer")).unwrap();
        tracker.push(None).unwrap();
        assert!(remote.remote_commit_exists("local", "scorer", &sha).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_repository_or_bad_sha_is_false() {
        let root = tempdir().unwrap();
        let remote = LocalRemote::new(root.path(), "local");
        assert!(!remote.remote_commit_exists("local", "nope", "abc").await.unwrap());
        remote.create_repository("scorer", None).await.unwrap();
        assert!(!remote.remote_commit_exists("local", "scorer", "not-hex").await.unwrap());
    }

    #[test]
    fn test_clone_url_round_trips_through_parser() {
        let remote = LocalRemote::new(Path::new("/srv/remotes"), "acme");
        assert_eq!(
            parse_owner_repo(&remote.clone_url("ranker")),
            Some(("acme".to_string(), "ranker".to_string()))
        );
    }
}
