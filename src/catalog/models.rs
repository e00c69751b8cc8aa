use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;

// String constants for SQL literals (keep in sync with as_str())
const STATUS_PENDING: &str = "pending";
const STATUS_PROCESSING: &str = "processing";
const STATUS_COMPLETED: &str = "completed";
const STATUS_FAILED: &str = "failed";
const STATUS_CANCELLED: &str = "cancelled";

/// Transcoding job lifecycle.
///
/// `Pending` and `Processing` are the *active* states; the rest are terminal
/// and never transition further. Every transition is a single compare-and-set
/// from an explicit set of expected states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,    // Queued, waiting for a worker
    Processing, // A worker is encoding
    Completed,  // Variant published
    Failed,     // Encoder or pipeline error
    Cancelled,  // Revoked by a user or a file deletion
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => STATUS_PENDING,
            JobStatus::Processing => STATUS_PROCESSING,
            JobStatus::Completed => STATUS_COMPLETED,
            JobStatus::Failed => STATUS_FAILED,
            JobStatus::Cancelled => STATUS_CANCELLED,
        }
    }

    pub fn parse(raw: &str) -> Option<JobStatus> {
        match raw {
            STATUS_PENDING => Some(JobStatus::Pending),
            STATUS_PROCESSING => Some(JobStatus::Processing),
            STATUS_COMPLETED => Some(JobStatus::Completed),
            STATUS_FAILED => Some(JobStatus::Failed),
            STATUS_CANCELLED => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container/stream probe result, produced by ffprobe and stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration: f64,
    pub width: i64,
    pub height: i64,
    pub codec: String,
    pub bitrate: i64,
    pub fps: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
}

/// A registered file: one uploaded object plus its derived variants.
///
/// `object_key` is the authoritative storage key and persists as long as the
/// row does. `transcoded_variants` maps target heights (as strings, `"480"`)
/// to the keys of published derivatives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub filename: String,
    pub object_key: String,
    pub size: i64,
    pub mime_type: String,
    pub file_hash: Option<String>,
    pub description: Option<String>,
    pub user_id: Option<i64>,
    pub video_metadata: Option<VideoMetadata>,
    pub transcoded_variants: BTreeMap<String, String>,
    pub upload_date: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    /// Heights with a published variant, ascending.
    pub fn available_qualities(&self) -> Vec<i64> {
        let mut qualities: Vec<i64> = self
            .transcoded_variants
            .keys()
            .filter_map(|q| q.parse().ok())
            .collect();
        qualities.sort_unstable();
        qualities
    }

    pub fn variant_key(&self, quality: i64) -> Option<&str> {
        self.transcoded_variants
            .get(&quality.to_string())
            .map(String::as_str)
    }
}

/// One transcoding task: source file, target height, and its run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingJob {
    pub id: i64,
    pub file_id: i64,
    pub target_quality: i64,
    pub status: JobStatus,
    pub progress: f64,
    pub output_key: Option<String>,
    pub output_size: Option<i64>,
    pub error_message: Option<String>,
    pub encoder_metadata: Option<VideoMetadata>,
    pub queue_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Field patch applied together with a status transition. Fields left `None`
/// keep their current value.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub progress: Option<f64>,
    pub output_key: Option<String>,
    pub output_size: Option<i64>,
    pub error_message: Option<String>,
    pub encoder_metadata: Option<VideoMetadata>,
    pub queue_task_id: Option<String>,
}

/// Fields for registering a new file.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub filename: String,
    pub object_key: String,
    pub size: i64,
    pub mime_type: String,
    pub file_hash: Option<String>,
    pub description: Option<String>,
    pub user_id: Option<i64>,
}

/// A quality the catalog declined to create a job for, and why.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedQuality {
    pub quality: i64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("queued"), None);
    }

    #[test]
    fn active_vs_terminal() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn available_qualities_sorted() {
        let mut variants = BTreeMap::new();
        variants.insert("720".to_string(), "transcoded/1/a_720p.mp4".to_string());
        variants.insert("480".to_string(), "transcoded/1/a_480p.mp4".to_string());
        let file = FileRecord {
            id: 1,
            filename: "a.mp4".to_string(),
            object_key: "uploads/2024/11/x.mp4".to_string(),
            size: 10,
            mime_type: "video/mp4".to_string(),
            file_hash: None,
            description: None,
            user_id: None,
            video_metadata: None,
            transcoded_variants: variants,
            upload_date: Utc::now(),
        };
        assert!(file.is_video());
        assert_eq!(file.available_qualities(), vec![480, 720]);
        assert_eq!(file.variant_key(480), Some("transcoded/1/a_480p.mp4"));
        assert_eq!(file.variant_key(1080), None);
    }
}
