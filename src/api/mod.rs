//! HTTP surface
//!
//! Queue API, Conflict API and CI ingestion endpoints over the driver, plus
//! a Server-Sent Events stream of queue events.
//!
//! Mutating handlers run the engine operation on its own task so a client
//! that disconnects mid-request cannot cancel a merge halfway through.

mod error;

pub use error::ErrorBody;

use crate::checks::{CheckRun, ExternalCheckRun};
use crate::conflicts::{ConflictReport, Resolution};
use crate::driver::{AdmitRequest, CancelOutcome, CheckStatusReport, MergeQueue, QueueItem};
use crate::error::{Error, Result};
use crate::types::{ChangeRequestId, EntryId, MergeMethod, QueueEntry, RepositoryId, StackMembership};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// The queue engine
    pub queue: Arc<MergeQueue>,
}

impl AppState {
    /// Wrap a queue engine
    pub const fn new(queue: Arc<MergeQueue>) -> Self {
        Self { queue }
    }
}

/// Body of `POST /repos/:owner/:name/queue`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueBody {
    /// Change request number
    pub number: u64,
    /// Higher merges sooner
    #[serde(default)]
    pub priority: i32,
    /// Merge method
    #[serde(default)]
    pub merge_method: MergeMethod,
    /// Stack membership
    #[serde(default)]
    pub stack: Option<StackMembership>,
    /// Who is admitting the change
    #[serde(default)]
    pub added_by: Option<String>,
}

/// Body of `PUT /repos/:owner/:name/queue/order`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderBody {
    /// Every active entry, in the new order
    pub entries: Vec<EntryId>,
}

/// Body of `POST .../conflicts`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveBody {
    /// Resolved file contents
    pub resolutions: Vec<Resolution>,
}

/// Response of `DELETE .../queue/:entry_id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Whether the cancellation waits for an in-flight merge
    pub deferred: bool,
    /// The entry after the request
    pub entry: QueueEntry,
}

impl From<CancelOutcome> for CancelResponse {
    fn from(outcome: CancelOutcome) -> Self {
        match outcome {
            CancelOutcome::Cancelled(entry) => Self { deferred: false, entry },
            CancelOutcome::Deferred(entry) => Self { deferred: true, entry },
        }
    }
}

/// Query of `GET /events`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    /// Only stream events of this repository (`owner/name`)
    #[serde(default)]
    pub repository: Option<RepositoryId>,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/repos/:owner/:name/queue", get(list_queue).post(enqueue))
        .route("/repos/:owner/:name/queue/history", get(history))
        .route("/repos/:owner/:name/queue/order", put(reorder))
        .route(
            "/repos/:owner/:name/queue/:entry_id",
            get(get_entry).delete(cancel_entry),
        )
        .route(
            "/repos/:owner/:name/queue/:entry_id/conflicts",
            get(check_conflicts).post(resolve_conflicts),
        )
        .route(
            "/repos/:owner/:name/pulls/:number/check-runs",
            post(record_check_run),
        )
        .route("/repos/:owner/:name/pulls/:number/checks", get(check_status))
        .route("/repos/:owner/:name/pulls/:number/closed", post(change_closed))
        .route("/events", get(events))
        .with_state(state)
}

/// Run an engine operation to completion even if the request is dropped
async fn detached<T, F>(operation: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|e| Error::Internal(format!("request task failed: {e}")))?
}

async fn entry_in(queue: &MergeQueue, repo: &RepositoryId, id: EntryId) -> Result<QueueEntry> {
    let entry = queue.get(id).await?;
    if entry.repository == *repo {
        Ok(entry)
    } else {
        Err(Error::EntryNotFound(id))
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_queue(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Vec<QueueItem>>> {
    let repo = RepositoryId::new(owner, name);
    Ok(Json(state.queue.list_with_metadata(&repo).await?))
}

async fn history(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Vec<QueueEntry>>> {
    let repo = RepositoryId::new(owner, name);
    Ok(Json(state.queue.history(&repo).await?))
}

async fn enqueue(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<QueueEntry>)> {
    let cr = ChangeRequestId::new(RepositoryId::new(owner, name), body.number);
    let request = AdmitRequest {
        change_request: cr,
        priority: body.priority,
        merge_method: body.merge_method,
        stack: body.stack,
        added_by: body.added_by.unwrap_or_else(|| "api".to_string()),
    };
    let queue = Arc::clone(&state.queue);
    let entry = detached(async move { queue.enqueue(request).await }).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn reorder(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<ReorderBody>,
) -> Result<Json<Vec<QueueEntry>>> {
    let repo = RepositoryId::new(owner, name);
    let queue = Arc::clone(&state.queue);
    let entries = detached(async move { queue.reorder(&repo, &body.entries).await }).await?;
    Ok(Json(entries))
}

async fn get_entry(
    State(state): State<AppState>,
    Path((owner, name, id)): Path<(String, String, EntryId)>,
) -> Result<Json<QueueEntry>> {
    let repo = RepositoryId::new(owner, name);
    Ok(Json(entry_in(&state.queue, &repo, id).await?))
}

async fn cancel_entry(
    State(state): State<AppState>,
    Path((owner, name, id)): Path<(String, String, EntryId)>,
) -> Result<Json<CancelResponse>> {
    let repo = RepositoryId::new(owner, name);
    entry_in(&state.queue, &repo, id).await?;
    let queue = Arc::clone(&state.queue);
    let outcome = detached(async move { queue.cancel(id).await }).await?;
    Ok(Json(outcome.into()))
}

async fn check_conflicts(
    State(state): State<AppState>,
    Path((owner, name, id)): Path<(String, String, EntryId)>,
) -> Result<Json<ConflictReport>> {
    let repo = RepositoryId::new(owner, name);
    entry_in(&state.queue, &repo, id).await?;
    let queue = Arc::clone(&state.queue);
    let report = detached(async move { queue.check_conflicts(id).await }).await?;
    Ok(Json(report))
}

async fn resolve_conflicts(
    State(state): State<AppState>,
    Path((owner, name, id)): Path<(String, String, EntryId)>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<QueueEntry>> {
    let repo = RepositoryId::new(owner, name);
    entry_in(&state.queue, &repo, id).await?;
    let queue = Arc::clone(&state.queue);
    let entry = detached(async move { queue.resolve_conflicts(id, &body.resolutions).await }).await?;
    Ok(Json(entry))
}

async fn record_check_run(
    State(state): State<AppState>,
    Path((owner, name, number)): Path<(String, String, u64)>,
    Json(body): Json<ExternalCheckRun>,
) -> Result<Json<CheckRun>> {
    let cr = ChangeRequestId::new(RepositoryId::new(owner, name), number);
    debug!(change_request = %cr, check = %body.name, status = %body.status, "check run received");
    let queue = Arc::clone(&state.queue);
    let run = detached(async move { queue.record_check_run(&cr, body.into_input()).await }).await?;
    Ok(Json(run))
}

async fn check_status(
    State(state): State<AppState>,
    Path((owner, name, number)): Path<(String, String, u64)>,
) -> Result<Json<CheckStatusReport>> {
    let cr = ChangeRequestId::new(RepositoryId::new(owner, name), number);
    Ok(Json(state.queue.check_status(&cr).await?))
}

async fn change_closed(
    State(state): State<AppState>,
    Path((owner, name, number)): Path<(String, String, u64)>,
) -> Result<Json<Option<CancelResponse>>> {
    let cr = ChangeRequestId::new(RepositoryId::new(owner, name), number);
    let queue = Arc::clone(&state.queue);
    let outcome = detached(async move { queue.handle_change_closed(&cr).await }).await?;
    Ok(Json(outcome.map(CancelResponse::from)))
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let subscription = state.queue.events().register(query.repository);
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse = Event::default().event(event.kind()).json_data(&event);
        Some((sse, subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
