//! Typed front-end over the S3-compatible object store.
//!
//! All byte movement in either direction passes through this module. The
//! backend is anything speaking the S3 API (MinIO in the reference
//! deployment); the SDK client is configured with explicit connect/read
//! timeouts and bounded retries, and a shared semaphore caps the number of
//! concurrent transfers so a burst of streaming downloads cannot exhaust the
//! connection pool.

pub mod key;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, ByteStreamError};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::config::S3Settings;

/// Chunk size for streaming reads. Tuned for throughput, not latency.
pub const STREAM_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 SDK error: {0}")]
    Sdk(String),
    #[error("ByteStream error: {0}")]
    ByteStream(#[from] ByteStreamError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Object metadata as reported by the store.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub size: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Which public endpoint a presigned URL should be signed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkHint {
    #[default]
    Auto,
    Local,
    Remote,
}

impl NetworkHint {
    /// Lenient parse of the `network` query hint; anything unrecognized is `Auto`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("local") => NetworkHint::Local,
            Some("remote") => NetworkHint::Remote,
            _ => NetworkHint::Auto,
        }
    }
}

/// Response-header overrides for presigned GETs.
#[derive(Debug, Clone, Default)]
pub struct PresignGetOptions {
    /// Adds `Content-Disposition: attachment; filename="…"` to the response
    pub download_filename: Option<String>,
    /// Forces the response `Content-Type`
    pub response_content_type: Option<String>,
}

/// Lazy, finite, non-restartable sequence of byte chunks. Dropping it
/// releases the underlying connection and its pool slot.
pub type ByteChunks = BoxStream<'static, Result<Bytes, StorageError>>;

/// Object storage operations (trait allows mocking for tests).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Idempotent bucket creation. Called once at startup; a failure here is fatal.
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    /// Store the file at `source` under `key`. `size` must be the authoritative
    /// byte count; on failure no partial object remains observable.
    async fn put(
        &self,
        object_key: &str,
        source: &Path,
        size: i64,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Object metadata, or `None` if the key does not exist.
    async fn stat(&self, object_key: &str) -> Result<Option<ObjectInfo>, StorageError>;

    /// Stream the whole object in bounded chunks.
    async fn get(&self, object_key: &str) -> Result<ByteChunks, StorageError>;

    /// Stream a contiguous byte range. `length == 0` means "until end".
    async fn get_range(
        &self,
        object_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<ByteChunks, StorageError>;

    /// Idempotent delete; a missing key is not an error.
    async fn delete(&self, object_key: &str) -> Result<(), StorageError>;

    /// Presigned PUT URL signed against the endpoint selected by `hint`.
    async fn presign_put(
        &self,
        object_key: &str,
        hint: NetworkHint,
    ) -> Result<String, StorageError>;

    /// Presigned GET URL with optional response-header overrides.
    async fn presign_get(
        &self,
        object_key: &str,
        hint: NetworkHint,
        options: PresignGetOptions,
    ) -> Result<String, StorageError>;
}

/// Production S3 object store.
///
/// Holds one data-plane client plus up to three presign clients, one per
/// configured public endpoint. Presigned URLs must be signed with a hostname
/// the eventual HTTP client can actually dial, which the internal endpoint
/// usually is not.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    presign: PresignClients,
    presign_expiry: Duration,
    transfers: Arc<Semaphore>,
}

struct PresignClients {
    /// `S3_PRESIGN_ENDPOINT`: single-endpoint override
    single: Option<Client>,
    /// `S3_PRESIGN_ENDPOINT_LOCAL`
    local: Option<Client>,
    /// `S3_PRESIGN_ENDPOINT_REMOTE`
    remote: Option<Client>,
    /// Fallback: the internal endpoint (only reachable inside the deployment)
    internal: Client,
}

impl PresignClients {
    fn select(&self, hint: NetworkHint) -> &Client {
        if let Some(single) = &self.single {
            return single;
        }
        match hint {
            NetworkHint::Local => {
                if let Some(local) = &self.local {
                    return local;
                }
            }
            NetworkHint::Remote => {
                if let Some(remote) = &self.remote {
                    return remote;
                }
            }
            NetworkHint::Auto => {}
        }
        // auto (and unconfigured hints): prefer local, then remote, then internal
        self.local
            .as_ref()
            .or(self.remote.as_ref())
            .unwrap_or(&self.internal)
    }
}

impl S3ObjectStore {
    /// Build the data-plane client and all presign clients up front. A
    /// concrete region is fixed here so signing never triggers a
    /// bucket-location round-trip.
    pub async fn new(settings: &S3Settings) -> Result<Self, StorageError> {
        let endpoint = normalize_endpoint(&settings.endpoint)?;
        let client = build_client(settings, &endpoint, true).await;

        let single = match &settings.presign_endpoint {
            Some(raw) => Some(build_client(settings, &normalize_endpoint(raw)?, false).await),
            None => None,
        };
        let local = match &settings.presign_endpoint_local {
            Some(raw) => Some(build_client(settings, &normalize_endpoint(raw)?, false).await),
            None => None,
        };
        let remote = match &settings.presign_endpoint_remote {
            Some(raw) => Some(build_client(settings, &normalize_endpoint(raw)?, false).await),
            None => None,
        };
        let internal = build_client(settings, &endpoint, false).await;

        Ok(S3ObjectStore {
            client,
            bucket: settings.bucket.clone(),
            presign: PresignClients {
                single,
                local,
                remote,
                internal,
            },
            presign_expiry: settings.presign_expiry,
            transfers: Arc::new(Semaphore::new(settings.pool_max.max(1))),
        })
    }

    async fn acquire_transfer(&self) -> Result<OwnedSemaphorePermit, StorageError> {
        self.transfers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Sdk("transfer pool closed".to_string()))
    }

    /// Wrap an SDK body into a bounded-chunk stream. The permit rides inside
    /// the stream state so the pool slot is released exactly when the stream
    /// is exhausted or dropped, including mid-transfer cancellation.
    fn chunked(body: ByteStream, permit: OwnedSemaphorePermit) -> ByteChunks {
        struct State {
            body: ByteStream,
            buf: BytesMut,
            done: bool,
            _permit: OwnedSemaphorePermit,
        }

        let state = State {
            body,
            buf: BytesMut::new(),
            done: false,
            _permit: permit,
        };

        futures::stream::try_unfold(state, |mut s| async move {
            loop {
                if s.buf.len() >= STREAM_CHUNK_SIZE {
                    let chunk = s.buf.split_to(STREAM_CHUNK_SIZE).freeze();
                    return Ok(Some((chunk, s)));
                }
                if s.done {
                    if s.buf.is_empty() {
                        return Ok(None);
                    }
                    let chunk = s.buf.split().freeze();
                    return Ok(Some((chunk, s)));
                }
                match s.body.try_next().await? {
                    Some(bytes) => s.buf.extend_from_slice(&bytes),
                    None => s.done = true,
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if !not_found {
                    return Err(StorageError::Sdk(format!(
                        "failed to access bucket '{}': {}",
                        self.bucket, e
                    )));
                }
            }
        }

        info!(bucket = %self.bucket, "creating bucket");
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let already_exists = e
                    .as_service_error()
                    .map(|se| {
                        se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists()
                    })
                    .unwrap_or(false);
                if already_exists {
                    Ok(())
                } else {
                    Err(StorageError::Sdk(format!(
                        "failed to create bucket '{}': {}",
                        self.bucket, e
                    )))
                }
            }
        }
    }

    async fn put(
        &self,
        object_key: &str,
        source: &Path,
        size: i64,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let _permit = self.acquire_transfer().await?;
        let body = ByteStream::from_path(source).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(body)
            .content_length(size)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Sdk(format!("put '{}' failed: {}", object_key, e)))?;

        debug!(key = %object_key, size, "object stored");
        Ok(())
    }

    async fn stat(&self, object_key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(head) => Ok(Some(ObjectInfo {
                size: head.content_length().unwrap_or(0),
                content_type: head.content_type().map(str::to_string),
                etag: head.e_tag().map(str::to_string),
                last_modified: head
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
            })),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(None)
                } else {
                    Err(StorageError::Sdk(format!(
                        "stat '{}' failed: {}",
                        object_key, e
                    )))
                }
            }
        }
    }

    async fn get(&self, object_key: &str) -> Result<ByteChunks, StorageError> {
        let permit = self.acquire_transfer().await?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| {
                if is_no_such_key(&e) {
                    StorageError::NotFound(object_key.to_string())
                } else {
                    StorageError::Sdk(format!("get '{}' failed: {}", object_key, e))
                }
            })?;
        Ok(Self::chunked(resp.body, permit))
    }

    async fn get_range(
        &self,
        object_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<ByteChunks, StorageError> {
        let permit = self.acquire_transfer().await?;
        let range = if length == 0 {
            format!("bytes={}-", offset)
        } else {
            format!("bytes={}-{}", offset, offset + length - 1)
        };
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .range(range)
            .send()
            .await
            .map_err(|e| {
                if is_no_such_key(&e) {
                    StorageError::NotFound(object_key.to_string())
                } else {
                    StorageError::Sdk(format!("get range '{}' failed: {}", object_key, e))
                }
            })?;
        Ok(Self::chunked(resp.body, permit))
    }

    async fn delete(&self, object_key: &str) -> Result<(), StorageError> {
        let _permit = self.acquire_transfer().await?;
        // S3 DeleteObject succeeds on missing keys, which gives us idempotence
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| StorageError::Sdk(format!("delete '{}' failed: {}", object_key, e)))?;
        Ok(())
    }

    async fn presign_put(
        &self,
        object_key: &str,
        hint: NetworkHint,
    ) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(self.presign_expiry)
            .map_err(|e| StorageError::Config(format!("invalid presign expiry: {}", e)))?;
        let presigned = self
            .presign
            .select(hint)
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .presigned(config)
            .await
            .map_err(|e| {
                StorageError::Sdk(format!("presign put '{}' failed: {}", object_key, e))
            })?;
        Ok(presigned.uri().to_string())
    }

    async fn presign_get(
        &self,
        object_key: &str,
        hint: NetworkHint,
        options: PresignGetOptions,
    ) -> Result<String, StorageError> {
        let config = PresigningConfig::expires_in(self.presign_expiry)
            .map_err(|e| StorageError::Config(format!("invalid presign expiry: {}", e)))?;

        let mut request = self
            .presign
            .select(hint)
            .get_object()
            .bucket(&self.bucket)
            .key(object_key);
        if let Some(filename) = &options.download_filename {
            request = request
                .response_content_disposition(format!("attachment; filename=\"{}\"", filename));
        }
        if let Some(content_type) = &options.response_content_type {
            request = request.response_content_type(content_type);
        }

        let presigned = request.presigned(config).await.map_err(|e| {
            StorageError::Sdk(format!("presign get '{}' failed: {}", object_key, e))
        })?;
        Ok(presigned.uri().to_string())
    }
}

fn is_no_such_key<E, R>(err: &aws_sdk_s3::error::SdkError<E, R>) -> bool
where
    E: aws_sdk_s3::error::ProvideErrorMetadata,
{
    err.as_service_error()
        .and_then(|se| se.code())
        .map(|code| code == "NoSuchKey")
        .unwrap_or(false)
}

/// Accepts either a full URL (`http://1.2.3.4:9000`) or a bare `host:port`;
/// the SDK wants a URL, so bare host:port defaults to plain HTTP.
fn normalize_endpoint(raw: &str) -> Result<String, StorageError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StorageError::Config("empty S3 endpoint".to_string()));
    }
    if trimmed.contains("://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("http://{}", trimmed))
    }
}

async fn build_client(settings: &S3Settings, endpoint: &str, data_plane: bool) -> Client {
    let credentials = Credentials::new(
        settings.access_key.clone(),
        settings.secret_key.clone(),
        None,
        None,
        "nebula-s3-config",
    );

    let mut builder = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.presign_region.clone()))
        .credentials_provider(credentials)
        .endpoint_url(endpoint);

    if data_plane {
        builder = builder
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(settings.connect_timeout)
                    .read_timeout(settings.read_timeout)
                    .build(),
            )
            .retry_config(
                RetryConfig::standard()
                    .with_max_attempts(settings.total_retries + 1)
                    .with_initial_backoff(Duration::from_secs_f64(settings.backoff_factor)),
            );
    } else {
        // Presign clients never dial; a warning-free no-retry config keeps
        // URL minting instantaneous.
        builder = builder.retry_config(RetryConfig::disabled());
    }

    let aws_config = builder.load().await;
    // Path-style addressing: MinIO and friends don't resolve
    // virtual-hosted-style bucket subdomains.
    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();
    if data_plane {
        info!(endpoint, "s3 data-plane client ready");
    } else {
        debug!(endpoint, "presign client ready");
    }
    Client::from_conf(s3_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_hint_parse() {
        assert_eq!(NetworkHint::parse(None), NetworkHint::Auto);
        assert_eq!(NetworkHint::parse(Some("local")), NetworkHint::Local);
        assert_eq!(NetworkHint::parse(Some("REMOTE")), NetworkHint::Remote);
        assert_eq!(NetworkHint::parse(Some("tailscale")), NetworkHint::Auto);
        assert_eq!(NetworkHint::parse(Some("  auto ")), NetworkHint::Auto);
    }

    #[test]
    fn normalize_endpoint_accepts_both_forms() {
        assert_eq!(
            normalize_endpoint("http://minio:9000").unwrap(),
            "http://minio:9000"
        );
        assert_eq!(
            normalize_endpoint("https://s3.example.com").unwrap(),
            "https://s3.example.com"
        );
        assert_eq!(
            normalize_endpoint("1.2.3.4:9000").unwrap(),
            "http://1.2.3.4:9000"
        );
        assert!(normalize_endpoint("  ").is_err());
    }
}
