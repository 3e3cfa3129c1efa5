//! Platform service factory

use crate::auth::get_github_auth;
use crate::config::Config;
use crate::error::Result;
use crate::platform::{ChangeRequestService, GitHubService};
use std::sync::Arc;
use tracing::debug;

/// Create the change-request service described by the config.
///
/// Resolves the GitHub token and registers each repository's code owners.
pub async fn create_change_request_service(config: &Config) -> Result<Arc<dyn ChangeRequestService>> {
    let host = config.github.host.as_deref();
    let auth = get_github_auth(host).await?;
    debug!(source = %auth.source, "resolved GitHub credentials");

    let mut service = match &config.github.api_base {
        Some(api_base) => GitHubService::with_api_base(&auth.token, api_base)?,
        None => GitHubService::new(&auth.token, host)?,
    };
    for repo in &config.repositories {
        service = service.with_code_owners(repo.id(), repo.code_owners.iter().cloned());
    }

    Ok(Arc::new(service))
}
