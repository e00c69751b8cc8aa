//! One-job control flow: turn a pending job into a `completed` row with a
//! durable variant, or a `failed`/`cancelled` row. Every path acks the
//! delivery — a durable terminal row is the outcome either way, so
//! redelivery would not help.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::catalog::models::{FileRecord, JobPatch, JobStatus, TranscodingJob};
use crate::catalog::{Catalog, CatalogError};
use crate::config::WorkerSettings;
use crate::queue::{Delivery, JobQueue};
use crate::storage::{key, ObjectStore};

use super::encoder::{Encoder, ProgressEvent};
use super::presets;
use super::probe::Prober;
use super::TranscodeError;

/// Cap on the error text persisted to the catalog.
const ERROR_MESSAGE_LIMIT: usize = 2000;

/// Everything one worker needs to process jobs.
pub struct TranscoderContext {
    catalog: Catalog,
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn JobQueue>,
    encoder: Encoder,
    prober: Prober,
    time_limit: Duration,
}

impl TranscoderContext {
    pub fn new(
        catalog: Catalog,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
        settings: &WorkerSettings,
    ) -> Self {
        TranscoderContext {
            catalog,
            store,
            queue,
            encoder: Encoder::new(settings.ffmpeg_path.clone()),
            prober: Prober::new(settings.ffprobe_path.clone()),
            time_limit: settings.job_time_limit,
        }
    }

    /// Process one delivery end to end and settle it.
    pub async fn handle(&self, delivery: Delivery) {
        let job_id = delivery.task.job_id;

        let job = match self.claim(&delivery).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.settle(&delivery).await;
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "failed to claim job");
                self.settle(&delivery).await;
                return;
            }
        };

        info!(
            job_id,
            file_id = job.file_id,
            quality = job.target_quality,
            "transcode started"
        );

        match self.run(&delivery, &job).await {
            Ok(output_key) => {
                info!(job_id, output_key = %output_key, "transcode completed");
            }
            Err(TranscodeError::Cancelled) => {
                self.finish(job_id, JobStatus::Cancelled, "Cancelled by user")
                    .await;
                info!(job_id, "transcode cancelled");
            }
            Err(e) => {
                self.finish(job_id, JobStatus::Failed, &e.to_string()).await;
                error!(job_id, error = %e, "transcode failed");
            }
        }

        self.settle(&delivery).await;
    }

    /// Load the job and CAS it to `processing`. Returns `None` when there is
    /// nothing to do: the job is gone, already terminal (cancelled while
    /// queued), revoked, or another worker won the claim.
    async fn claim(&self, delivery: &Delivery) -> Result<Option<TranscodingJob>, TranscodeError> {
        let job_id = delivery.task.job_id;
        let Some(job) = self.catalog.get_job(job_id).await? else {
            warn!(job_id, "job vanished before pickup");
            return Ok(None);
        };
        if job.status.is_terminal() {
            info!(job_id, status = %job.status, "job already terminal, skipping");
            return Ok(None);
        }
        if self.queue.is_cancelled(&delivery.task_id).await? {
            let _ = self
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
                .await;
            info!(job_id, "job revoked while queued");
            return Ok(None);
        }

        match self
            .catalog
            .transition_job(
                job_id,
                &[JobStatus::Pending],
                JobStatus::Processing,
                JobPatch {
                    progress: Some(0.0),
                    queue_task_id: Some(delivery.task_id.clone()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(job) => Ok(Some(job)),
            Err(CatalogError::StateConflict { current, .. }) => {
                info!(job_id, status = %current, "lost the claim, skipping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The encode pipeline proper. The scratch directory lives for exactly
    /// this call; `TempDir` removes it on every exit path.
    async fn run(
        &self,
        delivery: &Delivery,
        job: &TranscodingJob,
    ) -> Result<String, TranscodeError> {
        let file = self
            .catalog
            .get_file(job.file_id)
            .await?
            .ok_or_else(|| TranscodeError::Encoder("source file record deleted".to_string()))?;
        let preset = presets::preset_for(job.target_quality).ok_or_else(|| {
            TranscodeError::Encoder(format!("unknown quality {}", job.target_quality))
        })?;

        let scratch = TempDir::new()?;
        let input_path = scratch.path().join(source_filename(&file));
        let downloaded = self.download_source(&file.object_key, &input_path).await?;
        info!(
            job_id = job.id,
            bytes = downloaded,
            "source downloaded to scratch"
        );

        let source_meta = self
            .prober
            .probe(&input_path)
            .await
            .map_err(|e| TranscodeError::Probe(format!("source probe failed: {}", e)))?;
        if file.video_metadata.is_none() {
            if let Err(e) = self
                .catalog
                .set_video_metadata(file.id, &source_meta)
                .await
            {
                warn!(file_id = file.id, error = %e, "could not backfill video metadata");
            }
        }

        let output_key = key::variant_key(file.id, &file.filename, job.target_quality);
        let output_path = scratch
            .path()
            .join(format!("{}p.mp4", job.target_quality));

        // Progress plumbing: the encoder emits processed-duration events;
        // this task translates them to percentages, persists them, and polls
        // the revocation flag so a stalled encoder can still be cancelled.
        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressEvent>(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let consumer = {
            let catalog = self.catalog.clone();
            let queue = Arc::clone(&self.queue);
            let task_id = delivery.task_id.clone();
            let job_id = job.id;
            let total = source_meta.duration;
            tokio::spawn(async move {
                let mut reported = 0.0f64;
                let mut poll = tokio::time::interval(Duration::from_secs(2));
                loop {
                    tokio::select! {
                        maybe_event = progress_rx.recv() => {
                            let Some(event) = maybe_event else { break };
                            let pct = percent(event.processed, total);
                            if pct - reported >= 1.0 {
                                reported = pct;
                                if let Err(e) = catalog.update_progress(job_id, pct).await {
                                    warn!(job_id, error = %e, "progress update failed");
                                }
                                let _ = queue.publish_progress(&task_id, pct).await;
                            }
                        }
                        _ = poll.tick() => {
                            if queue.is_cancelled(&task_id).await.unwrap_or(false) {
                                let _ = cancel_tx.send(true);
                            }
                        }
                    }
                }
            })
        };

        let encode_result = match tokio::time::timeout(
            self.time_limit,
            self.encoder
                .encode(&input_path, &output_path, preset, progress_tx, cancel_rx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TranscodeError::TimeLimitExceeded),
        };
        let _ = consumer.await;
        encode_result?;

        let encoder_meta = self
            .prober
            .probe(&output_path)
            .await
            .map_err(|e| TranscodeError::Probe(format!("output probe failed: {}", e)))?;
        let output_size = tokio::fs::metadata(&output_path).await?.len() as i64;

        self.store
            .put(&output_key, &output_path, output_size, "video/mp4")
            .await?;

        match self
            .catalog
            .complete_job(
                job.id,
                file.id,
                job.target_quality,
                &output_key,
                output_size,
                &encoder_meta,
            )
            .await
        {
            Ok(_) => Ok(output_key),
            Err(CatalogError::StateConflict { current, .. }) => {
                // Cancelled (or otherwise finalized) while we were uploading:
                // the variant must not outlive the decision
                warn!(job_id = job.id, status = %current, "completion lost, removing variant");
                if let Err(e) = self.store.delete(&output_key).await {
                    error!(key = %output_key, error = %e, "orphan variant cleanup failed");
                }
                Err(TranscodeError::Cancelled)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn download_source(&self, object_key: &str, dest: &Path) -> Result<u64, TranscodeError> {
        let mut chunks = self.store.get(object_key).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = chunks.try_next().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Terminal transition for failure and cancellation paths. A job that is
    /// already terminal (e.g. cancelled during upload) is left untouched.
    async fn finish(&self, job_id: i64, to: JobStatus, message: &str) {
        let mut message = message.to_string();
        message.truncate(ERROR_MESSAGE_LIMIT);
        if let Err(e) = self
            .catalog
            .transition_job(
                job_id,
                &JobStatus::ACTIVE,
                to,
                JobPatch {
                    error_message: Some(message),
                    ..Default::default()
                },
            )
            .await
        {
            match e {
                CatalogError::StateConflict { current, .. } => {
                    info!(job_id, status = %current, "job already finalized");
                }
                other => error!(job_id, error = %other, "terminal transition failed"),
            }
        }
    }

    async fn settle(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            error!(task_id = %delivery.task_id, error = %e, "ack failed");
        }
    }
}

/// Local scratch name for the downloaded source; keeps the original
/// extension so ffmpeg's demuxer detection works.
fn source_filename(file: &FileRecord) -> PathBuf {
    let ext = file
        .filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .unwrap_or("bin");
    PathBuf::from(format!("source.{}", ext))
}

/// Map processed output duration to 0-100. An unknown total degrades to 0
/// until completion; during the encode the value is capped just below 100
/// because 100 is reserved for the completed state.
fn percent(processed: Duration, total_seconds: f64) -> f64 {
    if total_seconds <= 0.0 {
        return 0.0;
    }
    ((processed.as_secs_f64() / total_seconds) * 100.0).min(99.9)
}
