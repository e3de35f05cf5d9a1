use anyhow::{Context, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::RemoteHost;
use crate::config::DEFAULT_GITHUB_API;

const USER_AGENT: &str = "fnforge";

/// The authenticated user (subset of fields).
#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Debug, Serialize)]
struct CreateRepoRequest<'a> {
    name: &'a str,
    private: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    auto_init: bool,
}

/// Known GitHub token prefixes.
const GITHUB_TOKEN_PREFIXES: &[&str] = &["ghp_", "github_pat_", "gho_", "ghu_", "ghs_", "ghr_"];

/// Format check only; does not verify the token is active.
pub fn is_valid_github_token(token: &str) -> bool {
    !token.is_empty()
        && GITHUB_TOKEN_PREFIXES
            .iter()
            .any(|prefix| token.starts_with(prefix))
}

/// Repositories on GitHub under one owner (user or organization).
pub struct GitHubRemote {
    client: reqwest::Client,
    owner: String,
    token: String,
    api_base: String,
    private: bool,
}

impl GitHubRemote {
    pub fn new(owner: &str, token: String) -> Self {
        if !is_valid_github_token(&token) {
            tracing::warn!("GITHUB_TOKEN does not look like a GitHub token");
        }
        Self {
            client: reqwest::Client::new(),
            owner: owner.to_string(),
            token,
            api_base: DEFAULT_GITHUB_API.to_string(),
            private: true,
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    /// GET that maps 200 to true and 404/409/422 to false.
    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        let resp = self
            .get(path)
            .send()
            .await
            .with_context(|| format!("Failed to send request to GitHub: {}", path))?;
        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
                Ok(false)
            }
            status => bail!("GitHub API returned {} for {}", status, path),
        }
    }

    async fn authenticated_login(&self) -> anyhow::Result<String> {
        let user: GitHubUser = self
            .get("/user")
            .send()
            .await
            .context("Failed to send user request to GitHub")?
            .error_for_status()
            .context("GitHub user API returned error status")?
            .json()
            .await
            .context("Failed to parse user response from GitHub")?;
        Ok(user.login)
    }
}

#[async_trait]
impl RemoteHost for GitHubRemote {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn repository_exists(&self, name: &str) -> anyhow::Result<bool> {
        self.exists(&format!("/repos/{}/{}", self.owner, name)).await
    }

    async fn remote_commit_exists(
        &self,
        owner: &str,
        repository: &str,
        commit: &str,
    ) -> anyhow::Result<bool> {
        self.exists(&format!("/repos/{}/{}/commits/{}", owner, repository, commit))
            .await
    }

    async fn create_repository(&self, name: &str, description: Option<&str>) -> anyhow::Result<()> {
        // Personal repositories and organization repositories use different endpoints.
        let login = self.authenticated_login().await?;
        let url = if login.eq_ignore_ascii_case(&self.owner) {
            format!("{}/user/repos", self.api_base)
        } else {
            format!("{}/orgs/{}/repos", self.api_base, self.owner)
        };
        let body = CreateRepoRequest {
            name,
            private: self.private,
            description,
            auto_init: false,
        };
        self.client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .json(&body)
            .send()
            .await
            .context("Failed to send create-repository request to GitHub")?
            .error_for_status()
            .with_context(|| format!("GitHub refused to create repository {}/{}", self.owner, name))?;
        tracing::info!(owner = %self.owner, name, "created GitHub repository");
        Ok(())
    }

    fn clone_url(&self, name: &str) -> String {
        format!("https://github.com/{}/{}.git", self.owner, name)
    }

    fn push_token(&self) -> Option<&str> {
        Some(&self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token_prefixes() {
        assert!(is_valid_github_token("ghp_abc123def456"));
        assert!(is_valid_github_token("github_pat_abc123def456"));
        assert!(is_valid_github_token("ghs_xyz789"));
    }

    #[test]
    fn test_invalid_tokens() {
        assert!(!is_valid_github_token(""));
        assert!(!is_valid_github_token("not-a-token"));
        assert!(!is_valid_github_token("GHP_abc123"));
        assert!(!is_valid_github_token(" ghp_abc123"));
    }

    #[test]
    fn test_clone_url_uses_owner() {
        let remote = GitHubRemote::new("acme", "ghp_x".into());
        assert_eq!(remote.clone_url("scorer"), "https://github.com/acme/scorer.git");
        assert_eq!(remote.owner(), "acme");
        assert_eq!(remote.push_token(), Some("ghp_x"));
    }

    #[test]
    fn test_api_base_trailing_slash_is_trimmed() {
        let remote = GitHubRemote::new("acme", "ghp_x".into()).with_api_base("http://localhost:9/");
        assert_eq!(remote.api_base, "http://localhost:9");
    }

    #[test]
    fn test_create_request_omits_missing_description() {
        let body = CreateRepoRequest {
            name: "scorer",
            private: true,
            description: None,
            auto_init: false,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("description").is_none());
        assert_eq!(json["private"], true);
    }

    #[tokio::test]
    async fn test_unreachable_api_is_an_error_not_false() {
        let remote = GitHubRemote::new("acme", "ghp_x".into()).with_api_base("http://127.0.0.1:9");
        assert!(remote.repository_exists("scorer").await.is_err());
    }
}
