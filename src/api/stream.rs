//! Range-aware streaming and full-file download.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::catalog::models::FileRecord;
use crate::error::ApiError;
use crate::storage::{NetworkHint, PresignGetOptions};

use super::range::{RangeError, RangeSpec};
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Variant height to stream (480|720|1080); original when absent
    pub quality: Option<i64>,
}

/// `GET /api/files/{id}/stream[?quality=Q]` — the central playback endpoint.
///
/// Without a `Range` header this is a plain 200 with the whole body; with
/// one it answers 206 with the canonicalized slice, or 416 when no byte of
/// the requested range exists. `Accept-Ranges: bytes` is always advertised
/// so players know seeking works.
pub async fn stream(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let file = state
        .catalog
        .get_file(file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("File not found".to_string()))?;

    let (object_key, size, content_type) = resolve_target(&state, &file, query.quality).await?;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(range_header) = range_header else {
        debug!(file_id, %object_key, size, "streaming full object");
        let body = Body::from_stream(state.store.get(&object_key).await?);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, size)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(body)
            .map_err(|e| ApiError::Internal(e.to_string()));
    };

    let range = match RangeSpec::resolve(&range_header, size) {
        Ok(range) => range,
        Err(RangeError::Unsatisfiable) => return Err(ApiError::RangeNotSatisfiable { size }),
        Err(RangeError::Malformed) => {
            return Err(ApiError::Validation(format!(
                "invalid Range header: {}",
                range_header
            )))
        }
    };

    debug!(file_id, %object_key, start = range.start, end = range.end, "streaming range");
    let body = Body::from_stream(
        state
            .store
            .get_range(&object_key, range.start, range.len())
            .await?,
    );
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_RANGE, range.content_range(size))
        .header(header::CONTENT_LENGTH, range.len())
        .header(header::ACCEPT_RANGES, "bytes")
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// `GET /api/files/{id}/download` — full body with an attachment disposition.
pub async fn download(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Response, ApiError> {
    let file = state
        .catalog
        .get_file(file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("File not found".to_string()))?;

    info!(file_id, filename = %file.filename, size = file.size, "download requested");
    let body = Body::from_stream(state.store.get(&file.object_key).await?);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &file.mime_type)
        .header(header::CONTENT_LENGTH, file.size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", sanitize_filename(&file.filename)),
        )
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct PresignDownloadQuery {
    pub network: Option<String>,
    pub quality: Option<i64>,
}

/// `GET /api/files/{id}/presign` — mint a presigned GET URL so the client
/// can pull the bytes straight from the store, with the original filename
/// forced as an attachment.
pub async fn presign_download(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    Query(query): Query<PresignDownloadQuery>,
) -> Result<Json<Value>, ApiError> {
    let file = state
        .catalog
        .get_file(file_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("File not found".to_string()))?;

    let (object_key, _, content_type) = resolve_target(&state, &file, query.quality).await?;
    let hint = NetworkHint::parse(query.network.as_deref());
    let download_url = state
        .store
        .presign_get(
            &object_key,
            hint,
            PresignGetOptions {
                download_filename: Some(sanitize_filename(&file.filename)),
                response_content_type: Some(content_type),
            },
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "object_key": object_key,
        "download_url": download_url,
    })))
}

/// Pick which object backs the response. A requested variant that is
/// missing (not yet transcoded, or its object vanished) falls back to the
/// original rather than erroring; the player just gets the source quality.
async fn resolve_target(
    state: &AppState,
    file: &FileRecord,
    quality: Option<i64>,
) -> Result<(String, u64, String), ApiError> {
    if let Some(quality) = quality {
        if let Some(variant_key) = file.variant_key(quality) {
            match state.store.stat(variant_key).await? {
                Some(info) => {
                    debug!(file_id = file.id, quality, "streaming transcoded variant");
                    return Ok((
                        variant_key.to_string(),
                        info.size as u64,
                        "video/mp4".to_string(),
                    ));
                }
                None => {
                    warn!(
                        file_id = file.id,
                        quality,
                        key = %variant_key,
                        "variant registered but missing from storage, using original"
                    );
                }
            }
        } else {
            debug!(file_id = file.id, quality, "quality not available, using original");
        }
    }
    Ok((
        file.object_key.clone(),
        file.size as u64,
        file.mime_type.clone(),
    ))
}

fn sanitize_filename(filename: &str) -> String {
    filename.replace(['"', '\r', '\n'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_cannot_break_the_header() {
        assert_eq!(sanitize_filename("plain.mp4"), "plain.mp4");
        assert_eq!(sanitize_filename("we\"ird\n.mp4"), "we_ird_.mp4");
    }
}
