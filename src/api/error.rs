//! HTTP mapping of engine errors

use crate::error::Error;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// Error body returned by every endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code (see [`Error::code`])
    pub error: String,
    /// Human-readable message
    pub message: String,
}

impl Error {
    /// HTTP status for this error.
    ///
    /// - queue and ordering conflicts: 409
    /// - missing entries, repositories or change requests: 404
    /// - incomplete resolutions and unmapped check values: 422
    /// - workspace contention: 423
    /// - upstream git and platform failures: 502
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyQueued { .. }
            | Self::InvalidReorder(_)
            | Self::StackOrderViolation(_)
            | Self::InvalidTransition { .. }
            | Self::NotResolvable(_)
            | Self::ConcurrentBaseUpdate(_)
            | Self::ChangeRequestClosed(_)
            | Self::MergeConflict { .. } => StatusCode::CONFLICT,
            Self::EntryNotFound(_) | Self::UnknownRepository(_) | Self::ChangeRequestNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::IncompleteResolution(_) | Self::CheckMappingUnknown { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::WorkspaceUnavailable(_) => StatusCode::LOCKED,
            Self::Git(_) | Self::GitHubApi(_) | Self::Platform(_) | Self::PushRejected(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_) | Self::Storage(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
