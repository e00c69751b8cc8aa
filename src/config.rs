use std::time::Duration;

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Application configuration, sourced entirely from environment variables.
///
/// Loaded once at process start and passed into component constructors; no
/// part of the system reads the environment after this.
#[derive(Clone, Debug)]
pub struct Settings {
    /// SQLite catalog location, e.g. `sqlite:///var/nebula/catalog.db`
    pub database_url: String,
    /// Broker URL, e.g. `redis://nebula-queue:6379/0`
    pub redis_url: String,
    /// Shared application secret (reserved for future auth)
    pub secret_key: String,
    /// Address the API server binds to
    pub bind_addr: String,
    pub s3: S3Settings,
    pub worker: WorkerSettings,
}

/// Object-store configuration, including presign endpoints and HTTP tunables.
#[derive(Clone, Debug)]
pub struct S3Settings {
    /// Internal data-plane endpoint (reachable from inside the deployment)
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Single-endpoint presign override; takes precedence over local/remote
    pub presign_endpoint: Option<String>,
    /// Presign endpoint for clients on the local network
    pub presign_endpoint_local: Option<String>,
    /// Presign endpoint for remote clients (e.g. a tailnet hostname)
    pub presign_endpoint_remote: Option<String>,
    pub presign_expiry: Duration,
    /// Fixed signing region; avoids a bucket-location round-trip on presign
    pub presign_region: String,
    /// Upper bound on concurrent object-store transfers
    pub pool_max: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub total_retries: u32,
    pub backoff_factor: f64,
}

/// Transcoder worker configuration.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    /// Number of jobs one worker process runs concurrently
    pub concurrency: usize,
    /// Wall-clock cap per job; exceeding it fails the job
    pub job_time_limit: Duration,
}

impl Settings {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Settings {
            database_url: require("DATABASE_URL")?,
            redis_url: require("REDIS_URL")?,
            secret_key: require("SECRET_KEY")?,
            bind_addr: optional("NEBULA_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            s3: S3Settings {
                endpoint: require("S3_ENDPOINT")?,
                access_key: require("S3_ACCESS_KEY")?,
                secret_key: require("S3_SECRET_KEY")?,
                bucket: require("S3_BUCKET")?,
                presign_endpoint: optional("S3_PRESIGN_ENDPOINT"),
                presign_endpoint_local: optional("S3_PRESIGN_ENDPOINT_LOCAL"),
                presign_endpoint_remote: optional("S3_PRESIGN_ENDPOINT_REMOTE"),
                presign_expiry: Duration::from_secs(parse("S3_PRESIGN_EXPIRES_SECONDS", 900u64)?),
                presign_region: optional("S3_PRESIGN_REGION")
                    .unwrap_or_else(|| "us-east-1".to_string()),
                pool_max: parse("S3_HTTP_POOL_MAXSIZE", 32usize)?,
                connect_timeout: Duration::from_secs_f64(parse(
                    "S3_HTTP_CONNECT_TIMEOUT",
                    5.0f64,
                )?),
                read_timeout: Duration::from_secs_f64(parse("S3_HTTP_READ_TIMEOUT", 60.0f64)?),
                total_retries: parse("S3_HTTP_TOTAL_RETRIES", 3u32)?,
                backoff_factor: parse("S3_HTTP_BACKOFF_FACTOR", 0.2f64)?,
            },
            worker: WorkerSettings {
                ffmpeg_path: optional("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
                ffprobe_path: optional("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".to_string()),
                concurrency: parse("WORKER_CONCURRENCY", 1usize)?,
                job_time_limit: Duration::from_secs(parse("JOB_TIME_LIMIT_SECONDS", 4 * 3600u64)?),
            },
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn optional(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(var) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_falls_back_to_default() {
        std::env::remove_var("NEBULA_TEST_UNSET");
        let v: u64 = parse("NEBULA_TEST_UNSET", 900u64).unwrap();
        assert_eq!(v, 900);
    }

    #[test]
    fn parse_rejects_garbage() {
        std::env::set_var("NEBULA_TEST_GARBAGE", "not-a-number");
        let r: Result<u64, _> = parse("NEBULA_TEST_GARBAGE", 1u64);
        assert!(r.is_err());
        std::env::remove_var("NEBULA_TEST_GARBAGE");
    }
}
