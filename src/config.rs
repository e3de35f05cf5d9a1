//! Configuration for fnforge.
//!
//! Settings are read from `fnforge.toml` in the workspace directory and
//! layered: defaults → file → environment → CLI flags.
//!
//! ```toml
//! [agent]
//! claude_cmd = "claude"
//! skip_permissions = true
//!
//! [remote]
//! kind = "github"          # or "local"
//! owner = "acme"
//! private = true
//!
//! [build]
//! max_attempts = 5
//! test_cmd = "./check.sh"
//! test_timeout_secs = 300
//!
//! [author]
//! name = "fnforge"
//! email = "fnforge@localhost"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tracker::CommitAuthor;

pub const CONFIG_FILE: &str = "fnforge.toml";
/// Default location of the local remote, relative to the workspace.
pub const DEFAULT_LOCAL_REMOTE_DIR: &str = ".fnforge-remote";
pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

/// Where finalized functions are pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteKind {
    /// Repositories on GitHub, managed through the REST API.
    Github,
    /// Bare repositories under a local directory.
    #[default]
    Local,
}

impl std::fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteKind::Github => write!(f, "github"),
            RemoteKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for RemoteKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(RemoteKind::Github),
            "local" => Ok(RemoteKind::Local),
            _ => bail!("Invalid remote kind '{}'. Valid values: github, local", s),
        }
    }
}

/// Agent backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Claude CLI command (default: "claude")
    #[serde(default)]
    pub claude_cmd: Option<String>,
    /// Whether to pass --dangerously-skip-permissions
    #[serde(default = "default_skip_permissions")]
    pub skip_permissions: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_skip_permissions() -> bool {
    true
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            claude_cmd: None,
            skip_permissions: default_skip_permissions(),
            model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    #[serde(default)]
    pub kind: RemoteKind,
    #[serde(default)]
    pub owner: Option<String>,
    /// Root of the local remote (kind = "local")
    #[serde(default)]
    pub local_root: Option<PathBuf>,
    /// Create GitHub repositories as private
    #[serde(default = "default_private")]
    pub private: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_private() -> bool {
    true
}

fn default_api_base() -> String {
    DEFAULT_GITHUB_API.to_string()
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            kind: RemoteKind::default(),
            owner: None,
            local_root: None,
            private: default_private(),
            api_base: default_api_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSection {
    /// Attempt budget of the build-validate-submit loop
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Optional external test command run in the node directory
    #[serde(default)]
    pub test_cmd: Option<String>,
    #[serde(default = "default_test_timeout_secs")]
    pub test_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_test_timeout_secs() -> u64 {
    300
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            test_cmd: None,
            test_timeout_secs: default_test_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorSection {
    #[serde(default = "default_author_name")]
    pub name: String,
    #[serde(default = "default_author_email")]
    pub email: String,
}

fn default_author_name() -> String {
    CommitAuthor::default().name
}

fn default_author_email() -> String {
    CommitAuthor::default().email
}

impl Default for AuthorSection {
    fn default() -> Self {
        Self {
            name: default_author_name(),
            email: default_author_email(),
        }
    }
}

/// The complete fnforge.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FnforgeToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub author: AuthorSection,
}

impl FnforgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fnforge.toml")
    }

    /// Load `<workspace>/fnforge.toml`, or defaults if it does not exist.
    pub fn load_or_default(workspace: &Path) -> Result<Self> {
        let config_path = workspace.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize fnforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.build.max_attempts == 0 {
            warnings.push("build.max_attempts is 0; the build loop will never run".to_string());
        }
        if self.build.test_timeout_secs == 0 {
            warnings.push("build.test_timeout_secs is 0; every test command will time out".to_string());
        }
        if self.remote.kind == RemoteKind::Github && self.remote.local_root.is_some() {
            warnings.push("remote.local_root is ignored for github remotes".to_string());
        }
        warnings
    }
}

/// Flag-level overrides, applied last.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub claude_cmd: Option<String>,
    pub remote_kind: Option<RemoteKind>,
    pub owner: Option<String>,
    pub remote_root: Option<PathBuf>,
    pub max_attempts: Option<u32>,
}

/// Resolved remote settings.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub kind: RemoteKind,
    pub owner: String,
    pub local_root: PathBuf,
    pub private: bool,
    pub api_base: String,
    pub token: Option<String>,
}

/// Fully resolved runtime settings for one process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub workspace: PathBuf,
    pub claude_cmd: String,
    pub skip_permissions: bool,
    pub model: Option<String>,
    pub remote: RemoteSettings,
    pub max_attempts: u32,
    pub test_cmd: Option<(String, Duration)>,
    pub author: CommitAuthor,
}

impl Settings {
    /// Resolve settings against the process environment.
    pub fn resolve(workspace: &Path, overrides: &CliOverrides) -> Result<Self> {
        Self::resolve_with_env(workspace, overrides, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_env(
        workspace: &Path,
        overrides: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        std::fs::create_dir_all(workspace)
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
        let workspace = workspace
            .canonicalize()
            .context("Failed to resolve workspace directory")?;
        let toml = FnforgeToml::load_or_default(&workspace)?;
        for warning in toml.validate() {
            tracing::warn!("{}", warning);
        }

        let claude_cmd = overrides
            .claude_cmd
            .clone()
            .or_else(|| env("CLAUDE_CMD"))
            .or(toml.agent.claude_cmd.clone())
            .unwrap_or_else(|| "claude".to_string());
        let skip_permissions = match env("SKIP_PERMISSIONS") {
            Some(value) => value != "false",
            None => toml.agent.skip_permissions,
        };

        let kind = overrides.remote_kind.unwrap_or(toml.remote.kind);
        let token = env("GITHUB_TOKEN").filter(|t| !t.trim().is_empty());
        let owner = overrides.owner.clone().or(toml.remote.owner.clone());
        let owner = match (kind, owner) {
            (_, Some(owner)) => owner,
            (RemoteKind::Local, None) => "local".to_string(),
            (RemoteKind::Github, None) => {
                bail!("remote.owner must be set (fnforge.toml or --owner) for github remotes")
            }
        };
        if kind == RemoteKind::Github && token.is_none() {
            bail!("GITHUB_TOKEN must be set for github remotes");
        }
        let local_root = overrides
            .remote_root
            .clone()
            .or_else(|| env("FNFORGE_REMOTE_ROOT").map(PathBuf::from))
            .or(toml.remote.local_root.clone())
            .map(|root| {
                if root.is_absolute() {
                    root
                } else {
                    workspace.join(root)
                }
            })
            .unwrap_or_else(|| workspace.join(DEFAULT_LOCAL_REMOTE_DIR));

        let test_cmd = toml
            .build
            .test_cmd
            .clone()
            .filter(|cmd| !cmd.trim().is_empty())
            .map(|cmd| (cmd, Duration::from_secs(toml.build.test_timeout_secs)));

        Ok(Self {
            claude_cmd,
            skip_permissions,
            model: toml.agent.model.clone(),
            remote: RemoteSettings {
                kind,
                owner,
                local_root,
                private: toml.remote.private,
                api_base: toml.remote.api_base.clone(),
                token,
            },
            max_attempts: overrides.max_attempts.unwrap_or(toml.build.max_attempts),
            test_cmd,
            author: CommitAuthor {
                name: toml.author.name.clone(),
                email: toml.author.email.clone(),
            },
            workspace,
        })
    }

    /// Directory of the node called `name`.
    pub fn node_dir(&self, name: &str) -> PathBuf {
        self.workspace.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_remote_kind_from_str() {
        assert_eq!("GitHub".parse::<RemoteKind>().unwrap(), RemoteKind::Github);
        assert_eq!("local".parse::<RemoteKind>().unwrap(), RemoteKind::Local);
        assert!("s3".parse::<RemoteKind>().is_err());
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = FnforgeToml::parse("").unwrap();
        assert_eq!(toml.build.max_attempts, 5);
        assert_eq!(toml.build.test_timeout_secs, 300);
        assert!(toml.agent.skip_permissions);
        assert_eq!(toml.remote.kind, RemoteKind::Local);
        assert_eq!(toml.author.name, "fnforge");
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let content = r#"
[agent]
claude_cmd = "my-claude"
skip_permissions = false

[remote]
kind = "github"
owner = "acme"
private = false

[build]
max_attempts = 2
test_cmd = "make check"
"#;
        let toml = FnforgeToml::parse(content).unwrap();
        assert_eq!(toml.agent.claude_cmd.as_deref(), Some("my-claude"));
        assert!(!toml.agent.skip_permissions);
        assert_eq!(toml.remote.kind, RemoteKind::Github);
        assert_eq!(toml.remote.owner.as_deref(), Some("acme"));
        assert_eq!(toml.build.max_attempts, 2);
        assert_eq!(toml.build.test_cmd.as_deref(), Some("make check"));
    }

    #[test]
    fn test_validate_flags_zero_attempts() {
        let toml = FnforgeToml::parse("[build]\nmax_attempts = 0\n").unwrap();
        assert_eq!(toml.validate().len(), 1);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let mut toml = FnforgeToml::default();
        toml.build.max_attempts = 9;
        toml.save(&dir.path().join(CONFIG_FILE)).unwrap();
        let loaded = FnforgeToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.build.max_attempts, 9);
    }

    #[test]
    fn test_resolve_defaults_to_local_remote() {
        let dir = tempdir().unwrap();
        let settings =
            Settings::resolve_with_env(dir.path(), &CliOverrides::default(), env_of(&[])).unwrap();
        assert_eq!(settings.claude_cmd, "claude");
        assert_eq!(settings.remote.kind, RemoteKind::Local);
        assert_eq!(settings.remote.owner, "local");
        assert!(settings.remote.local_root.ends_with(DEFAULT_LOCAL_REMOTE_DIR));
        assert_eq!(settings.max_attempts, 5);
        assert!(settings.test_cmd.is_none());
    }

    #[test]
    fn test_resolve_layers_file_env_and_cli() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[agent]\nclaude_cmd = \"file-claude\"\n[build]\nmax_attempts = 3\ntest_cmd = \"true\"\ntest_timeout_secs = 7\n",
        )
        .unwrap();

        let settings =
            Settings::resolve_with_env(dir.path(), &CliOverrides::default(), env_of(&[])).unwrap();
        assert_eq!(settings.claude_cmd, "file-claude");
        assert_eq!(settings.test_cmd, Some(("true".to_string(), Duration::from_secs(7))));

        let settings = Settings::resolve_with_env(
            dir.path(),
            &CliOverrides::default(),
            env_of(&[("CLAUDE_CMD", "env-claude"), ("FNFORGE_REMOTE_ROOT", "/srv/remotes")]),
        )
        .unwrap();
        assert_eq!(settings.claude_cmd, "env-claude");
        assert_eq!(settings.remote.local_root, PathBuf::from("/srv/remotes"));

        let overrides = CliOverrides {
            claude_cmd: Some("cli-claude".into()),
            max_attempts: Some(1),
            ..CliOverrides::default()
        };
        let settings = Settings::resolve_with_env(
            dir.path(),
            &overrides,
            env_of(&[("CLAUDE_CMD", "env-claude")]),
        )
        .unwrap();
        assert_eq!(settings.claude_cmd, "cli-claude");
        assert_eq!(settings.max_attempts, 1);
    }

    #[test]
    fn test_resolve_github_requires_owner_and_token() {
        let dir = tempdir().unwrap();
        let overrides = CliOverrides {
            remote_kind: Some(RemoteKind::Github),
            ..CliOverrides::default()
        };
        let err = Settings::resolve_with_env(dir.path(), &overrides, env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("remote.owner"));

        let overrides = CliOverrides {
            remote_kind: Some(RemoteKind::Github),
            owner: Some("acme".into()),
            ..CliOverrides::default()
        };
        let err = Settings::resolve_with_env(dir.path(), &overrides, env_of(&[])).unwrap_err();
        assert!(err.to_string().contains("GITHUB_TOKEN"));

        let settings =
            Settings::resolve_with_env(dir.path(), &overrides, env_of(&[("GITHUB_TOKEN", "ghp_x")]))
                .unwrap();
        assert_eq!(settings.remote.token.as_deref(), Some("ghp_x"));
        assert_eq!(settings.remote.owner, "acme");
    }

    #[test]
    fn test_node_dir_is_under_workspace() {
        let dir = tempdir().unwrap();
        let settings =
            Settings::resolve_with_env(dir.path(), &CliOverrides::default(), env_of(&[])).unwrap();
        assert_eq!(settings.node_dir("scorer"), settings.workspace.join("scorer"));
    }
}
