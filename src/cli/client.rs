//! HTTP client for a running mergeq service

use mergeq::api::{CancelResponse, EnqueueBody, ErrorBody, ReorderBody, ResolveBody};
use mergeq::conflicts::{ConflictReport, Resolution};
use mergeq::driver::{CheckStatusReport, QueueItem};
use mergeq::error::{Error, Result};
use mergeq::types::{EntryId, QueueEntry, RepositoryId};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Client for the queue HTTP API
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// Client for the service at `base` (e.g. `http://127.0.0.1:8080`)
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("mergeq/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn repo_url(&self, repo: &RepositoryId, rest: &str) -> String {
        format!("{}/repos/{}/{}/{rest}", self.base, repo.owner, repo.name)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        debug!(%status, url = %response.url(), "service response");
        if status.is_success() {
            return Ok(response.json().await?);
        }
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(Error::Platform(format!("{} ({})", body.message, body.error))),
            Err(_) => Err(Error::Platform(format!("service returned {status}"))),
        }
    }

    /// Active entries with change request metadata
    pub async fn list(&self, repo: &RepositoryId) -> Result<Vec<QueueItem>> {
        self.send(self.http.get(self.repo_url(repo, "queue"))).await
    }

    /// Finished entries
    pub async fn history(&self, repo: &RepositoryId) -> Result<Vec<QueueEntry>> {
        self.send(self.http.get(self.repo_url(repo, "queue/history")))
            .await
    }

    /// Admit a change request
    pub async fn enqueue(&self, repo: &RepositoryId, body: &EnqueueBody) -> Result<QueueEntry> {
        self.send(self.http.post(self.repo_url(repo, "queue")).json(body))
            .await
    }

    /// Look up an entry
    pub async fn get(&self, repo: &RepositoryId, id: EntryId) -> Result<QueueEntry> {
        self.send(self.http.get(self.repo_url(repo, &format!("queue/{id}"))))
            .await
    }

    /// Cancel an entry
    pub async fn cancel(&self, repo: &RepositoryId, id: EntryId) -> Result<CancelResponse> {
        self.send(self.http.delete(self.repo_url(repo, &format!("queue/{id}"))))
            .await
    }

    /// Replace the queue order
    pub async fn reorder(&self, repo: &RepositoryId, entries: Vec<EntryId>) -> Result<Vec<QueueEntry>> {
        self.send(
            self.http
                .put(self.repo_url(repo, "queue/order"))
                .json(&ReorderBody { entries }),
        )
        .await
    }

    /// Run conflict detection for an entry
    pub async fn conflicts(&self, repo: &RepositoryId, id: EntryId) -> Result<ConflictReport> {
        self.send(
            self.http
                .get(self.repo_url(repo, &format!("queue/{id}/conflicts"))),
        )
        .await
    }

    /// Submit resolutions for an entry
    pub async fn resolve(
        &self,
        repo: &RepositoryId,
        id: EntryId,
        resolutions: Vec<Resolution>,
    ) -> Result<QueueEntry> {
        self.send(
            self.http
                .post(self.repo_url(repo, &format!("queue/{id}/conflicts")))
                .json(&ResolveBody { resolutions }),
        )
        .await
    }

    /// Check state of a change request
    pub async fn checks(&self, repo: &RepositoryId, number: u64) -> Result<CheckStatusReport> {
        self.send(
            self.http
                .get(self.repo_url(repo, &format!("pulls/{number}/checks"))),
        )
        .await
    }
}
