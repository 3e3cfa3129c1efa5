//! GitHub change-request service implementation

use crate::checks::{CheckOutput, CheckRunInput, ExternalCheckRun};
use crate::error::{Error, Result};
use crate::platform::ChangeRequestService;
use crate::types::{Approval, ChangeRequest, ChangeRequestId, ChangeRequestState, RepositoryId};
use async_trait::async_trait;
use chrono::Utc;
use octocrab::Octocrab;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Public GitHub API
const DEFAULT_API_BASE: &str = "https://api.github.com";

/// GitHub service using octocrab for pull requests and raw HTTP for reviews
/// and check runs
pub struct GitHubService {
    client: Octocrab,
    /// Token for raw HTTP requests
    token: String,
    /// HTTP client for raw requests
    http_client: Client,
    /// API base URL for raw requests (no trailing slash)
    api_base: String,
    /// Designated code owners per repository
    code_owners: HashMap<RepositoryId, BTreeSet<String>>,
}

impl GitHubService {
    /// Create a new GitHub service.
    ///
    /// `host` selects a GitHub Enterprise instance (`https://{host}/api/v3`).
    pub fn new(token: &str, host: Option<&str>) -> Result<Self> {
        let api_base = host.map_or_else(
            || DEFAULT_API_BASE.to_string(),
            |h| format!("https://{h}/api/v3"),
        );
        Self::with_api_base(token, &api_base)
    }

    /// Create a service against an explicit API base URL
    pub fn with_api_base(token: &str, api_base: &str) -> Result<Self> {
        let api_base = api_base.trim_end_matches('/').to_string();

        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .base_uri(&api_base)
            .map_err(|e| Error::GitHubApi(e.to_string()))?
            .build()
            .map_err(|e| Error::GitHubApi(e.to_string()))?;

        let http_client = Client::builder()
            .user_agent("mergeq")
            .build()
            .map_err(|e| Error::GitHubApi(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            token: token.to_string(),
            http_client,
            api_base,
            code_owners: HashMap::new(),
        })
    }

    /// Register the code owners of a repository
    #[must_use]
    pub fn with_code_owners(
        mut self,
        repo: RepositoryId,
        owners: impl IntoIterator<Item = String>,
    ) -> Self {
        self.code_owners.insert(repo, owners.into_iter().collect());
        self
    }

    fn is_code_owner(&self, repo: &RepositoryId, login: &str) -> bool {
        self.code_owners
            .get(repo)
            .is_some_and(|owners| owners.contains(login))
    }

    /// GET a JSON document; `None` on 404
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let response = self
            .http_client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| Error::GitHubApi(format!("Request to {url} failed: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::GitHubApi(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }

        let body = response
            .json()
            .await
            .map_err(|e| Error::GitHubApi(format!("Failed to parse {url}: {e}")))?;
        Ok(Some(body))
    }
}

fn is_not_found(err: &octocrab::Error) -> bool {
    matches!(err, octocrab::Error::GitHub { source, .. } if source.status_code.as_u16() == 404)
}

#[derive(Deserialize)]
struct ReviewUser {
    login: String,
}

#[derive(Deserialize)]
struct Review {
    user: Option<ReviewUser>,
    state: String,
}

/// Latest deciding review per reviewer; comments do not change a decision
fn approvals_from_reviews(reviews: Vec<Review>) -> Vec<String> {
    let mut decisions: BTreeMap<String, String> = BTreeMap::new();
    for review in reviews {
        let Some(user) = review.user else {
            continue;
        };
        if matches!(review.state.as_str(), "APPROVED" | "CHANGES_REQUESTED" | "DISMISSED") {
            decisions.insert(user.login, review.state);
        }
    }
    decisions
        .into_iter()
        .filter(|(_, state)| state == "APPROVED")
        .map(|(login, _)| login)
        .collect()
}

#[derive(Deserialize)]
struct CheckRunsResponse {
    check_runs: Vec<GitHubCheckRun>,
}

#[derive(Deserialize)]
struct GitHubCheckRun {
    name: String,
    head_sha: String,
    status: String,
    conclusion: Option<String>,
    details_url: Option<String>,
    output: Option<GitHubCheckOutput>,
}

#[derive(Deserialize)]
struct GitHubCheckOutput {
    title: Option<String>,
    summary: Option<String>,
}

impl From<GitHubCheckRun> for ExternalCheckRun {
    fn from(run: GitHubCheckRun) -> Self {
        Self {
            name: run.name,
            head_sha: run.head_sha,
            status: run.status,
            conclusion: run.conclusion,
            details_url: run.details_url,
            output: run.output.map(|o| CheckOutput {
                title: o.title,
                summary: o.summary,
            }),
        }
    }
}

#[async_trait]
impl ChangeRequestService for GitHubService {
    async fn get_change_request(&self, id: &ChangeRequestId) -> Result<ChangeRequest> {
        debug!(change_request = %id, "getting change request");
        let repo = &id.repository;

        let pr = match self
            .client
            .pulls(&repo.owner, &repo.name)
            .get(id.number)
            .await
        {
            Ok(pr) => pr,
            Err(e) if is_not_found(&e) => return Err(Error::ChangeRequestNotFound(id.clone())),
            Err(e) => return Err(e.into()),
        };

        // IssueState is non-exhaustive, so use wildcard for Closed and any future variants
        let state = match pr.state {
            Some(octocrab::models::IssueState::Open) => ChangeRequestState::Open,
            Some(octocrab::models::IssueState::Closed) if pr.merged_at.is_some() => {
                ChangeRequestState::Merged
            }
            Some(_) | None => ChangeRequestState::Closed,
        };

        let approvals = self.list_approvals(id).await?;

        let change = ChangeRequest {
            id: id.clone(),
            title: pr.title.clone().unwrap_or_default(),
            author: pr
                .user
                .as_ref()
                .map(|u| u.login.clone())
                .unwrap_or_default(),
            state,
            is_draft: pr.draft.unwrap_or(false),
            labels: pr
                .labels
                .as_ref()
                .map(|labels| labels.iter().map(|l| l.name.clone()).collect())
                .unwrap_or_default(),
            approvals,
            head_ref: pr.head.ref_field.clone(),
            head_sha: pr.head.sha.clone(),
            base_ref: pr.base.ref_field.clone(),
            updated_at: pr.updated_at.unwrap_or_else(Utc::now),
            html_url: pr
                .html_url
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        };

        debug!(change_request = %id, state = %change.state, approvals = change.approvals.len(), "got change request");
        Ok(change)
    }

    async fn list_approvals(&self, id: &ChangeRequestId) -> Result<Vec<Approval>> {
        let repo = &id.repository;
        let url = format!(
            "{}/repos/{}/{}/pulls/{}/reviews?per_page=100",
            self.api_base, repo.owner, repo.name, id.number
        );

        let reviews: Vec<Review> = self
            .get_json(&url)
            .await?
            .ok_or_else(|| Error::ChangeRequestNotFound(id.clone()))?;

        let approvals: Vec<Approval> = approvals_from_reviews(reviews)
            .into_iter()
            .map(|login| Approval {
                is_code_owner: self.is_code_owner(repo, &login),
                reviewer: login,
            })
            .collect();
        debug!(change_request = %id, count = approvals.len(), "listed approvals");
        Ok(approvals)
    }

    async fn list_check_runs(&self, id: &ChangeRequestId, head_sha: &str) -> Result<Vec<CheckRunInput>> {
        let repo = &id.repository;
        let url = format!(
            "{}/repos/{}/{}/commits/{head_sha}/check-runs?per_page=100",
            self.api_base, repo.owner, repo.name
        );

        let Some(response) = self.get_json::<CheckRunsResponse>(&url).await? else {
            debug!(change_request = %id, head_sha, "no check runs for commit");
            return Ok(Vec::new());
        };

        let runs: Vec<CheckRunInput> = response
            .check_runs
            .into_iter()
            .map(|run| ExternalCheckRun::from(run).into_input())
            .collect();
        debug!(change_request = %id, count = runs.len(), "listed check runs");
        Ok(runs)
    }
}
