//! HTTP surface. Handlers are stateless; all state lives in the catalog and
//! the object store, shared through [`AppState`].

pub mod files;
pub mod health;
pub mod range;
pub mod stream;
pub mod transcode;
pub mod upload;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::catalog::models::FileRecord;
use crate::catalog::Catalog;
use crate::queue::JobQueue;
use crate::storage::ObjectStore;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn JobQueue>,
}

/// Assemble the full router. Uploads can be tens of gigabytes, so the
/// default body limit is lifted; the inactivity timeout on the socket is the
/// effective guard.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/ping", get(health::ping))
        .route("/upload", post(upload::upload))
        .route("/upload/presign", post(upload::presign))
        .route("/upload/complete", post(upload::complete))
        .route("/files", get(files::list))
        .route("/files/:id", get(files::get).delete(files::delete))
        .route("/files/:id/stream", get(stream::stream))
        .route("/files/:id/download", get(stream::download))
        .route("/files/:id/presign", get(stream::presign_download))
        .route("/transcode", post(transcode::trigger))
        .route("/transcode/jobs", get(transcode::list_jobs))
        .route(
            "/transcode/job/:job_id",
            get(transcode::job_status).delete(transcode::cancel_job),
        )
        .route("/transcode/:file_id", get(transcode::file_status));

    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .nest("/api", api)
        .layer(DefaultBodyLimit::disable())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wire shape of a file record. `object_key` travels as `file_path` for
/// compatibility with the CLI clients.
#[derive(Debug, Serialize)]
pub struct FilePayload {
    pub id: i64,
    pub filename: String,
    #[serde(rename = "file_path")]
    pub object_key: String,
    pub size: i64,
    pub mime_type: String,
    pub upload_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub description: Option<String>,
    pub user_id: Option<i64>,
}

impl From<&FileRecord> for FilePayload {
    fn from(file: &FileRecord) -> Self {
        FilePayload {
            id: file.id,
            filename: file.filename.clone(),
            object_key: file.object_key.clone(),
            size: file.size,
            mime_type: file.mime_type.clone(),
            upload_date: file.upload_date,
            file_hash: file.file_hash.clone(),
            description: file.description.clone(),
            user_id: file.user_id,
        }
    }
}
