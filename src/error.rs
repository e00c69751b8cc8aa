//! HTTP-facing error taxonomy.
//!
//! Subsystem errors are folded into a small set of kinds; the kind picks the
//! status code and the message becomes the `detail` field of the JSON body.
//! Raw upstream errors are logged at the conversion site, not exposed.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::catalog::CatalogError;
use crate::queue::QueueError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Validation(String),
    #[error("Range not satisfiable")]
    RangeNotSatisfiable { size: u64 },
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    UpstreamTimeout(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = %status, detail = %self, "request failed");
        }

        let body = Json(json!({ "detail": self.to_string() }));
        match self {
            ApiError::RangeNotSatisfiable { size } => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{}", size))],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::DuplicateObjectKey(key) => {
                ApiError::Conflict(format!("object key already registered: {}", key))
            }
            CatalogError::StateConflict {
                job_id, current, ..
            } => ApiError::Conflict(format!("job {} is already {}", job_id, current)),
            CatalogError::MissingFile(id) => ApiError::NotFound(format!("File {} not found", id)),
            CatalogError::MissingJob(id) => ApiError::NotFound(format!("Job {} not found", id)),
            other => {
                error!(error = %other, "catalog failure");
                ApiError::Internal("catalog failure".to_string())
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(key) => {
                ApiError::NotFound(format!("object '{}' not found in storage", key))
            }
            StorageError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                error!(error = %io, "object store timeout");
                ApiError::UpstreamTimeout("object store timed out".to_string())
            }
            other => {
                error!(error = %other, "object store failure");
                ApiError::Upstream("object store unavailable".to_string())
            }
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        error!(error = %e, "broker failure");
        ApiError::Upstream("job queue unavailable".to_string())
    }
}
