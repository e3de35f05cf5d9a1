use anyhow::{Context, Result, bail};
use git2::{
    Cred, PushOptions, RemoteCallbacks, Repository, RepositoryInitOptions, Signature,
    StatusOptions,
};
use std::cell::RefCell;
use std::path::Path;

/// Branch every node repository is created on.
pub const DEFAULT_BRANCH: &str = "main";

/// Commit author used for node repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: "fnforge".to_string(),
            email: "fnforge@localhost".to_string(),
        }
    }
}

/// Local git operations on one node directory.
pub struct GitTracker {
    repo: Repository,
    author: CommitAuthor,
}

impl GitTracker {
    pub fn open(dir: &Path) -> Result<Self> {
        let repo = Repository::open(dir).context("Failed to open git repository")?;
        Ok(Self {
            repo,
            author: CommitAuthor::default(),
        })
    }

    /// Open the repository at `dir`, initializing one on `main` if absent.
    pub fn open_or_init(dir: &Path) -> Result<Self> {
        if dir.join(".git").exists() {
            return Self::open(dir);
        }
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(DEFAULT_BRANCH);
        let repo = Repository::init_opts(dir, &opts)
            .with_context(|| format!("Failed to init git repository in {}", dir.display()))?;
        Ok(Self {
            repo,
            author: CommitAuthor::default(),
        })
    }

    pub fn with_author(mut self, author: CommitAuthor) -> Self {
        self.author = author;
        self
    }

    /// True if the working tree has uncommitted (or untracked, non-ignored)
    /// changes.
    pub fn is_dirty(&self) -> Result<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;
        Ok(!statuses.is_empty())
    }

    /// Stage everything and commit. Returns the new commit SHA.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;

        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        // Pick up deletions too.
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let sig = Signature::now(&self.author.name, &self.author.email)?;

        // Handle unborn branch (new repo with no commits yet)
        let commit_id = if let Some(parent) = self.get_head_commit() {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };

        Ok(commit_id.to_string())
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Get current HEAD SHA (returns None for unborn branches)
    pub fn head_sha(&self) -> Option<String> {
        self.get_head_commit().map(|c| c.id().to_string())
    }

    fn branch_name(&self) -> String {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.shorthand().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string())
    }

    pub fn origin_url(&self) -> Option<String> {
        self.repo
            .find_remote("origin")
            .ok()
            .and_then(|remote| remote.url().map(str::to_string))
    }

    /// Point `origin` at `url`, creating or updating the remote.
    pub fn set_origin(&self, url: &str) -> Result<()> {
        if self.repo.find_remote("origin").is_ok() {
            self.repo
                .remote_set_url("origin", url)
                .context("Failed to update origin")?;
        } else {
            self.repo
                .remote("origin", url)
                .context("Failed to add origin")?;
        }
        Ok(())
    }

    /// Push the current branch to `origin`. `token` authenticates HTTPS
    /// remotes; local remotes need none.
    pub fn push(&self, token: Option<&str>) -> Result<()> {
        let mut remote = self
            .repo
            .find_remote("origin")
            .context("Repository has no origin remote")?;
        let branch = self.branch_name();
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);

        let rejection: RefCell<Option<String>> = RefCell::new(None);
        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = token {
            let token = token.to_string();
            callbacks.credentials(move |_url, _username, _allowed| {
                Cred::userpass_plaintext("x-access-token", &token)
            });
        }
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                *rejection.borrow_mut() = Some(format!("{}: {}", refname, message));
            }
            Ok(())
        });

        let mut opts = PushOptions::new();
        opts.remote_callbacks(callbacks);
        remote
            .push(&[refspec.as_str()], Some(&mut opts))
            .with_context(|| format!("Failed to push {} to origin", branch))?;
        drop(opts);

        if let Some(message) = rejection.into_inner() {
            bail!("Push rejected: {}", message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let tracker = GitTracker::open_or_init(dir.path()).unwrap();
        (tracker, dir)
    }

    #[test]
    fn test_head_sha_unborn_then_populated() {
        let (tracker, dir) = setup_repo();
        assert!(tracker.head_sha().is_none());
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let sha = tracker.commit_all("init").unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(tracker.head_sha(), Some(sha));
    }

    #[test]
    fn test_is_dirty_tracks_untracked_and_ignored() {
        let (tracker, dir) = setup_repo();
        assert!(!tracker.is_dirty().unwrap());
        fs::write(dir.path().join(".gitignore"), ".fnforge/\n").unwrap();
        assert!(tracker.is_dirty().unwrap());
        tracker.commit_all("ignore").unwrap();
        assert!(!tracker.is_dirty().unwrap());
        fs::create_dir_all(dir.path().join(".fnforge")).unwrap();
        fs::write(dir.path().join(".fnforge/session.json"), "{}").unwrap();
        assert!(!tracker.is_dirty().unwrap());
    }

    #[test]
    fn test_commit_all_records_deletions() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        tracker.commit_all("add").unwrap();
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        assert!(tracker.is_dirty().unwrap());
        tracker.commit_all("remove").unwrap();
        assert!(!tracker.is_dirty().unwrap());
    }

    #[test]
    fn test_commit_uses_configured_author() {
        let (tracker, dir) = setup_repo();
        let tracker = tracker.with_author(CommitAuthor {
            name: "Ada".into(),
            email: "ada@example.com".into(),
        });
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        tracker.commit_all("add").unwrap();
        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.author().name(), Some("Ada"));
        assert_eq!(head.message(), Some("add"));
    }

    #[test]
    fn test_push_to_bare_remote() {
        let (tracker, dir) = setup_repo();
        let remote_dir = tempdir().unwrap();
        let bare = Repository::init_bare(remote_dir.path()).unwrap();

        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let sha = tracker.commit_all("add").unwrap();
        assert!(tracker.origin_url().is_none());
        tracker
            .set_origin(remote_dir.path().to_str().unwrap())
            .unwrap();
        tracker.push(None).unwrap();

        let oid = git2::Oid::from_str(&sha).unwrap();
        assert!(bare.find_commit(oid).is_ok());
        assert_eq!(
            tracker.origin_url().as_deref(),
            remote_dir.path().to_str()
        );
    }

    #[test]
    fn test_push_without_origin_fails() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        tracker.commit_all("add").unwrap();
        assert!(tracker.push(None).is_err());
    }
}
