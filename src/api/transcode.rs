//! Transcoding control plane: trigger jobs, inspect them, cancel them.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::catalog::models::{JobPatch, JobStatus, TranscodingJob};
use crate::error::ApiError;
use crate::queue::TranscodeTask;
use crate::transcoder::presets;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct TranscodeRequest {
    pub file_id: i64,
    #[serde(default = "default_qualities")]
    pub qualities: Vec<i64>,
}

fn default_qualities() -> Vec<i64> {
    vec![480, 720]
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

/// `POST /api/transcode` — create and enqueue jobs for the requested
/// qualities. The catalog serializes concurrent requests: of two racing
/// callers exactly one gets a quality in `created`, the other sees it in
/// `skipped`.
pub async fn trigger(
    State(state): State<AppState>,
    Json(body): Json<TranscodeRequest>,
) -> Result<Json<Value>, ApiError> {
    let file = state
        .catalog
        .get_file(body.file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("File {} not found", body.file_id)))?;

    if !file.is_video() {
        return Err(ApiError::Validation(format!(
            "File {} is not a video. MIME type: {}",
            file.id, file.mime_type
        )));
    }
    if body.qualities.is_empty() {
        return Err(ApiError::Validation("no qualities requested".to_string()));
    }
    for &quality in &body.qualities {
        if !presets::is_supported(quality) {
            return Err(ApiError::Validation(format!(
                "Invalid quality: {}. Must be one of {:?}",
                quality,
                presets::supported_qualities()
            )));
        }
    }

    let (created, skipped) = state.catalog.create_jobs(file.id, &body.qualities).await?;
    let mut skipped: Vec<Value> = skipped
        .iter()
        .map(|s| json!({ "quality": s.quality, "reason": s.reason }))
        .collect();

    let mut created_payload = Vec::new();
    for job in &created {
        let task = TranscodeTask {
            job_id: job.id,
            file_id: file.id,
            target_quality: job.target_quality,
        };
        match state.queue.enqueue(&task).await {
            Ok(task_id) => {
                if let Err(e) = state.catalog.set_queue_task_id(job.id, &task_id).await {
                    warn!(job_id = job.id, error = %e, "could not record task id");
                }
                created_payload.push(json!({
                    "job_id": job.id,
                    "quality": job.target_quality,
                    "status": "queued",
                    "queue_task_id": task_id,
                }));
            }
            Err(e) => {
                // The job row must not stay pending forever with no task
                warn!(job_id = job.id, error = %e, "enqueue failed, failing job");
                let _ = state
                    .catalog
                    .transition_job(
                        job.id,
                        &[JobStatus::Pending],
                        JobStatus::Failed,
                        JobPatch {
                            error_message: Some("failed to enqueue task".to_string()),
                            ..Default::default()
                        },
                    )
                    .await;
                skipped.push(json!({
                    "quality": job.target_quality,
                    "reason": "queue unavailable",
                }));
            }
        }
    }

    info!(
        file_id = file.id,
        created = created_payload.len(),
        skipped = skipped.len(),
        "transcode requested"
    );
    Ok(Json(json!({
        "success": true,
        "file_id": file.id,
        "created": created_payload,
        "skipped": skipped,
    })))
}

/// `GET /api/transcode/{file_id}` — all jobs for a file plus the qualities
/// that already have a published variant.
pub async fn file_status(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let file = state
        .catalog
        .get_file(file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("File {} not found", file_id)))?;

    let jobs: Vec<Value> = state
        .catalog
        .jobs_for_file(file_id)
        .await?
        .iter()
        .map(|job| job_payload(job, Some(&file.filename)))
        .collect();

    Ok(Json(json!({
        "file_id": file.id,
        "filename": file.filename,
        "original_size": file.size,
        "is_video": file.is_video(),
        "jobs": jobs,
        "available_qualities": file.available_qualities(),
    })))
}

/// `GET /api/transcode/job/{job_id}` — one job, all fields.
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .catalog
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))?;
    let filename = state
        .catalog
        .get_file(job.file_id)
        .await?
        .map(|f| f.filename);

    let mut payload = job_payload(&job, filename.as_deref());
    payload["queue_task_id"] = json!(job.queue_task_id);
    payload["encoder_metadata"] = serde_json::to_value(&job.encoder_metadata)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(payload))
}

/// `GET /api/transcode/jobs?status=&skip=&limit=` — paginated listing.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            ApiError::Validation(format!("unknown status filter: {}", raw))
        })?),
        None => None,
    };
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 200);

    let (jobs, total) = state.catalog.list_jobs(status, skip, limit).await?;
    let entries: Vec<Value> = jobs
        .iter()
        .map(|(job, filename)| {
            json!({
                "job_id": job.id,
                "file_id": job.file_id,
                "filename": filename.as_deref().unwrap_or("unknown"),
                "target_quality": job.target_quality,
                "status": job.status,
                "progress": job.progress,
                "created_at": job.created_at,
                "completed_at": job.completed_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "total": total,
        "jobs": entries,
        "limit": limit,
        "skip": skip,
    })))
}

/// `DELETE /api/transcode/job/{job_id}` — cancel an active job: revoke the
/// queued/in-flight task, then settle the row. Terminal jobs are a 400.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .catalog
        .get_job(job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job {} not found", job_id)))?;

    if job.status.is_terminal() {
        return Err(ApiError::Validation(format!(
            "Cannot cancel job with status: {}",
            job.status
        )));
    }

    if let Some(task_id) = &job.queue_task_id {
        if let Err(e) = state.queue.revoke(task_id).await {
            warn!(job_id, error = %e, "revoke failed, cancelling row anyway");
        }
    }

    state
        .catalog
        .transition_job(
            job_id,
            &JobStatus::ACTIVE,
            JobStatus::Cancelled,
            JobPatch {
                error_message: Some("Cancelled by user".to_string()),
                ..Default::default()
            },
        )
        .await?;

    info!(job_id, "job cancelled");
    Ok(Json(json!({
        "message": format!("Job {} cancelled", job_id),
        "status": "cancelled",
    })))
}

fn job_payload(job: &TranscodingJob, filename: Option<&str>) -> Value {
    json!({
        "id": job.id,
        "file_id": job.file_id,
        "filename": filename.unwrap_or("unknown"),
        "target_quality": job.target_quality,
        "status": job.status,
        "progress": job.progress,
        "output_path": job.output_key,
        "output_size": job.output_size,
        "error_message": job.error_message,
        "created_at": job.created_at,
        "started_at": job.started_at,
        "completed_at": job.completed_at,
    })
}
