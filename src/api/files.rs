//! File catalog endpoints: list, inspect, delete.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::catalog::models::{JobPatch, JobStatus};
use crate::error::ApiError;

use super::{AppState, FilePayload};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub user_id: Option<i64>,
}

/// `GET /api/files` — newest first, `limit` clamped to 1..=100.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    let files = state.catalog.list_files(skip, limit, query.user_id).await?;
    let entries: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({
                "id": f.id,
                "filename": f.filename,
                "size": f.size,
                "mime_type": f.mime_type,
                "upload_date": f.upload_date,
                "description": f.description,
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "files": entries,
        "count": entries.len(),
    })))
}

/// `GET /api/files/{id}` — catalog fields plus live store metadata.
pub async fn get(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let file = state
        .catalog
        .get_file(file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("File not found".to_string()))?;

    let storage_info = state.store.stat(&file.object_key).await?.map(|info| {
        json!({
            "size": info.size,
            "content_type": info.content_type,
            "etag": info.etag,
            "last_modified": info.last_modified,
        })
    });

    let mut payload = serde_json::to_value(FilePayload::from(&file))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    payload["video_metadata"] = serde_json::to_value(&file.video_metadata)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    payload["transcoded_variants"] = serde_json::to_value(&file.transcoded_variants)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    payload["storage_info"] = storage_info.unwrap_or(Value::Null);

    Ok(Json(json!({ "success": true, "file": payload })))
}

/// `DELETE /api/files/{id}` — cascading delete.
///
/// Order matters: active jobs are revoked first so no worker can publish a
/// variant for a file that is going away, then the objects go, then the
/// rows. Object deletions are best-effort; a failure is logged and the row
/// removal proceeds (the reverse would leave a row pointing at nothing).
pub async fn delete(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let file = state
        .catalog
        .get_file(file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("File not found".to_string()))?;

    for job in state.catalog.jobs_for_file(file_id).await? {
        if !job.status.is_active() {
            continue;
        }
        if let Some(task_id) = &job.queue_task_id {
            if let Err(e) = state.queue.revoke(task_id).await {
                warn!(job_id = job.id, error = %e, "revoke failed during file delete");
            }
        }
        if let Err(e) = state
            .catalog
            .transition_job(
                job.id,
                &JobStatus::ACTIVE,
                JobStatus::Cancelled,
                JobPatch {
                    error_message: Some("File deleted".to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            // The job may have gone terminal on its own in the meantime
            warn!(job_id = job.id, error = %e, "could not cancel job during file delete");
        }
    }

    for variant_key in file.transcoded_variants.values() {
        if let Err(e) = state.store.delete(variant_key).await {
            warn!(key = %variant_key, error = %e, "variant object delete failed");
        }
    }
    if let Err(e) = state.store.delete(&file.object_key).await {
        warn!(key = %file.object_key, error = %e, "original object delete failed");
    }

    state.catalog.delete_file_rows(file_id).await?;
    info!(file_id, "file deleted");

    Ok(Json(json!({
        "success": true,
        "message": format!("File {} deleted successfully", file_id),
    })))
}
