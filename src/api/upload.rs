//! Upload paths: multipart through the API, and presign/complete for
//! direct-to-store uploads that bypass the API data plane.

use axum::extract::{Multipart, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::catalog::models::NewFile;
use crate::error::ApiError;
use crate::storage::{key, NetworkHint};

use super::{AppState, FilePayload};

/// A client that stops sending mid-upload should not hold the handler (and
/// its scratch file) forever.
const UPLOAD_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct NetworkQuery {
    /// Presign network hint: local|remote|auto
    pub network: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    pub filename: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub object_key: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub user_id: Option<i64>,
    pub file_hash: Option<String>,
}

/// `POST /api/upload` — multipart upload through the API.
///
/// The file part is spooled to a scratch file (hashing as it streams) so the
/// store receives an exact a-priori size, then registered in the catalog.
/// If registration fails the stored object is removed again; an object
/// without a row is a leak, not a file.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let scratch = TempDir::new()
        .map_err(|e| ApiError::Internal(format!("scratch dir unavailable: {}", e)))?;
    let spool_path = scratch.path().join("upload.part");

    let mut filename: Option<String> = None;
    let mut part_content_type: Option<String> = None;
    let mut description: Option<String> = None;
    let mut user_id: Option<i64> = None;
    let mut size: i64 = 0;
    let mut content_hash: Option<String> = None;
    let mut got_file = false;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("malformed multipart body: {}", e)))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                part_content_type = field.content_type().map(str::to_string);

                let mut spool = tokio::fs::File::create(&spool_path)
                    .await
                    .map_err(|e| ApiError::Internal(format!("spool create failed: {}", e)))?;
                let mut hasher = Sha256::new();
                size = 0;
                loop {
                    let chunk = tokio::time::timeout(UPLOAD_IDLE_TIMEOUT, field.chunk())
                        .await
                        .map_err(|_| {
                            ApiError::Validation("upload stalled, connection abandoned".into())
                        })?
                        .map_err(|e| ApiError::Validation(format!("upload body error: {}", e)))?;
                    let Some(chunk) = chunk else { break };
                    hasher.update(&chunk);
                    spool
                        .write_all(&chunk)
                        .await
                        .map_err(|e| ApiError::Internal(format!("spool write failed: {}", e)))?;
                    size += chunk.len() as i64;
                }
                spool
                    .flush()
                    .await
                    .map_err(|e| ApiError::Internal(format!("spool flush failed: {}", e)))?;
                content_hash = Some(hex::encode(hasher.finalize()));
                got_file = true;
            }
            Some("description") => {
                description = Some(field.text().await.map_err(|e| {
                    ApiError::Validation(format!("bad description field: {}", e))
                })?);
            }
            Some("user_id") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(format!("bad user_id field: {}", e)))?;
                user_id = Some(
                    raw.trim()
                        .parse()
                        .map_err(|_| ApiError::Validation("user_id must be an integer".into()))?,
                );
            }
            _ => {}
        }
    }

    let filename = match filename.filter(|f| !f.is_empty()) {
        Some(f) if got_file => f,
        _ => return Err(ApiError::Validation("No filename provided".to_string())),
    };
    let content_type = resolve_content_type(part_content_type.as_deref(), &filename);
    let object_key = key::upload_key(&filename);

    info!(%filename, %object_key, size, "uploading to object store");
    state
        .store
        .put(&object_key, &spool_path, size, &content_type)
        .await?;

    // Verification: the store-reported size is the authoritative one
    match state.store.stat(&object_key).await {
        Ok(Some(stat)) if stat.size != size => {
            warn!(%object_key, spooled = size, stored = stat.size, "size mismatch after upload");
        }
        Ok(Some(_)) => {}
        Ok(None) => warn!(%object_key, "object missing right after upload"),
        Err(e) => warn!(%object_key, error = %e, "post-upload stat failed"),
    }

    let inserted = state
        .catalog
        .insert_file(NewFile {
            filename,
            object_key: object_key.clone(),
            size,
            mime_type: content_type,
            file_hash: content_hash,
            description,
            user_id,
        })
        .await;

    let file = match inserted {
        Ok(file) => file,
        Err(e) => {
            // No row, no object: remove the orphan before reporting failure
            match state.store.delete(&object_key).await {
                Ok(()) => info!(%object_key, "cleaned up orphaned object"),
                Err(cleanup) => {
                    warn!(%object_key, error = %cleanup, "orphan cleanup failed, object leaked");
                }
            }
            return Err(e.into());
        }
    };

    info!(file_id = file.id, "upload registered");
    Ok(Json(json!({
        "success": true,
        "file": FilePayload::from(&file),
    })))
}

/// `POST /api/upload/presign` — mint a presigned PUT URL for a fresh
/// `uploads/…` key. The client must call `/api/upload/complete` afterwards
/// to register the object.
pub async fn presign(
    State(state): State<AppState>,
    Query(query): Query<NetworkQuery>,
    Json(body): Json<PresignRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.filename.trim().is_empty() {
        return Err(ApiError::Validation("filename is required".to_string()));
    }

    let hint = NetworkHint::parse(query.network.as_deref());
    let object_key = key::upload_key(&body.filename);
    let upload_url = state.store.presign_put(&object_key, hint).await?;

    Ok(Json(json!({
        "success": true,
        "object_key": object_key,
        "upload_url": upload_url,
    })))
}

/// `POST /api/upload/complete` — register an object uploaded out-of-band via
/// a presigned URL. Only keys under the `uploads/` prefix are accepted, and
/// the object must actually exist; its store-reported size wins.
pub async fn complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.object_key.trim().is_empty() || body.filename.trim().is_empty() {
        return Err(ApiError::Validation(
            "object_key and filename are required".to_string(),
        ));
    }
    if !key::is_upload_key(&body.object_key) {
        return Err(ApiError::Validation("Invalid object_key".to_string()));
    }

    let info = state
        .store
        .stat(&body.object_key)
        .await?
        .ok_or_else(|| ApiError::NotFound("Uploaded object not found in storage".to_string()))?;

    let content_type = match body.content_type.as_deref() {
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct.to_string(),
        _ => match info.content_type.as_deref() {
            Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct.to_string(),
            _ => resolve_content_type(None, &body.filename),
        },
    };

    let file = state
        .catalog
        .insert_file(NewFile {
            filename: body.filename,
            object_key: body.object_key,
            size: info.size,
            mime_type: content_type,
            file_hash: body.file_hash,
            description: body.description,
            user_id: body.user_id,
        })
        .await?;

    info!(file_id = file.id, "direct upload registered");
    Ok(Json(json!({
        "success": true,
        "file": FilePayload::from(&file),
    })))
}

/// Pick the effective MIME type: the client's, unless it's missing or the
/// generic octet-stream, in which case guess from the filename.
fn resolve_content_type(provided: Option<&str>, filename: &str) -> String {
    match provided {
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => ct.to_string(),
        _ => mime_guess::from_path(filename)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_prefers_the_client() {
        assert_eq!(
            resolve_content_type(Some("video/x-matroska"), "movie.mkv"),
            "video/x-matroska"
        );
    }

    #[test]
    fn generic_content_type_falls_back_to_guessing() {
        assert_eq!(
            resolve_content_type(Some("application/octet-stream"), "movie.mp4"),
            "video/mp4"
        );
        assert_eq!(resolve_content_type(None, "movie.mp4"), "video/mp4");
        assert_eq!(
            resolve_content_type(None, "mystery.zzz"),
            "application/octet-stream"
        );
    }
}
