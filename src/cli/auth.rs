//! Auth command - verify GitHub credentials

use crate::cli::style::{Stylize, check};
use anstream::println;
use mergeq::auth::{get_github_auth, test_github_auth};
use mergeq::config::Config;
use mergeq::error::{Error, Result};
use mergeq::types::RepositoryId;

/// Resolve a token and try it against a repository
pub async fn run_auth_test(config: &Config, repo: Option<RepositoryId>) -> Result<()> {
    let auth = get_github_auth(config.github.host.as_deref()).await?;
    println!("{} Token found ({})", check().success(), auth.source.to_string().muted());

    let repo = match repo {
        Some(repo) => repo,
        None => config
            .repositories
            .first()
            .map(mergeq::config::RepositoryConfig::id)
            .ok_or_else(|| Error::Config("no repository given or configured".to_string()))?,
    };
    test_github_auth(&auth, &repo).await?;
    println!("{} Can read {}", check().success(), repo.accent());
    Ok(())
}
