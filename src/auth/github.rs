//! GitHub token discovery

use super::AuthSource;
use crate::error::{Error, Result};
use crate::platform::{ChangeRequestService, GitHubService};
use crate::types::{ChangeRequestId, RepositoryId};
use tokio::process::Command;
use tracing::debug;

/// Environment variables checked for a token, in order
const TOKEN_VARS: [&str; 2] = ["GITHUB_TOKEN", "GH_TOKEN"];

/// Resolved GitHub credentials
#[derive(Debug, Clone)]
pub struct GitHubAuthConfig {
    /// API token
    pub token: String,
    /// Where the token came from
    pub source: AuthSource,
    /// Enterprise host, if any
    pub host: Option<String>,
}

fn token_from_env(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    TOKEN_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .map(|t| t.trim().to_string())
        .find(|t| !t.is_empty())
}

/// Get GitHub authentication.
///
/// Checks `GITHUB_TOKEN` and `GH_TOKEN`, then falls back to `gh auth token`.
pub async fn get_github_auth(host: Option<&str>) -> Result<GitHubAuthConfig> {
    if let Some(token) = token_from_env(|var| std::env::var(var).ok()) {
        debug!("using GitHub token from environment");
        return Ok(GitHubAuthConfig {
            token,
            source: AuthSource::EnvVar,
            host: host.map(str::to_string),
        });
    }

    let mut cmd = Command::new("gh");
    cmd.args(["auth", "token"]);
    if let Some(h) = host {
        cmd.args(["--hostname", h]);
    }

    let output = cmd.output().await.map_err(|e| {
        Error::Config(format!(
            "no GitHub token: set GITHUB_TOKEN or install gh ({e})"
        ))
    })?;
    if !output.status.success() {
        return Err(Error::Config(
            "no GitHub token: set GITHUB_TOKEN or run `gh auth login`".to_string(),
        ));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(Error::Config("gh returned an empty token".to_string()));
    }

    debug!("using GitHub token from gh CLI");
    Ok(GitHubAuthConfig {
        token,
        source: AuthSource::Cli,
        host: host.map(str::to_string),
    })
}

/// Verify credentials by reading a known change request.
///
/// A missing change request still proves the token works.
pub async fn test_github_auth(config: &GitHubAuthConfig, repo: &RepositoryId) -> Result<()> {
    let service = GitHubService::new(&config.token, config.host.as_deref())?;
    match service
        .list_approvals(&ChangeRequestId::new(repo.clone(), 1))
        .await
    {
        Ok(_) | Err(Error::ChangeRequestNotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}
