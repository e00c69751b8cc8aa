//! Broker-backed hand-off of transcode work from the API to the workers.
//!
//! Delivery is at-least-once: `enqueue` pushes a JSON envelope onto a Redis
//! list, workers `BLMOVE` it onto a processing list and `LREM` it away on
//! ack. Un-acked envelopes survive a worker crash on the processing list and
//! are swept back to the queue on worker startup. Revocation is a flag in a
//! cancellation set that workers poll at pickup and at every progress tick;
//! the worker's handler is idempotent, so redelivery of an already-terminal
//! job is acked and dropped.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const QUEUE_KEY: &str = "nebula:transcode:queue";
const PROCESSING_KEY: &str = "nebula:transcode:processing";
const CANCELLED_KEY: &str = "nebula:transcode:cancelled";
const PROGRESS_CHANNEL: &str = "nebula:transcode:progress";

/// How long a worker blocks waiting for work before `next` returns `None`.
const POP_TIMEOUT_SECS: f64 = 5.0;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),
    #[error("malformed task payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The one message type on the queue. The handler is statically known:
/// produce a variant for `(file_id, target_quality)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeTask {
    pub job_id: i64,
    pub file_id: i64,
    pub target_quality: i64,
}

/// Wire envelope: the task plus its revocation handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    task_id: String,
    task: TranscodeTask,
}

/// One received message. Must be settled with `ack` (done, success or
/// durable failure) or `nack` (redeliver).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub task_id: String,
    pub task: TranscodeTask,
    pub(crate) raw: String,
}

impl Delivery {
    #[doc(hidden)]
    pub fn from_raw(raw: String) -> Result<Self, QueueError> {
        let envelope: Envelope = serde_json::from_str(&raw)?;
        Ok(Delivery {
            task_id: envelope.task_id,
            task: envelope.task,
            raw,
        })
    }
}

/// Queue operations (trait allows an in-memory double for tests).
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a task; returns the opaque `task_id` used for revocation.
    async fn enqueue(&self, task: &TranscodeTask) -> Result<String, QueueError>;

    /// Block for up to the pop timeout; `None` means "no work right now".
    async fn next(&self) -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery. Failures are acked too: a durable `failed` row is
    /// the outcome, redelivery would not help.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Return a delivery to the queue for another worker.
    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Best-effort cancellation of queued or in-flight work.
    async fn revoke(&self, task_id: &str) -> Result<(), QueueError>;

    /// Whether `task_id` has been revoked. Workers poll this at natural
    /// suspension points.
    async fn is_cancelled(&self, task_id: &str) -> Result<bool, QueueError>;

    /// Fire-and-forget progress event on the side channel.
    async fn publish_progress(&self, task_id: &str, progress: f64) -> Result<(), QueueError>;

    /// Liveness probe for /health.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Sweep orphaned in-flight envelopes back onto the queue. Run at worker
    /// startup; duplicates are tolerated by handler idempotence.
    async fn requeue_stale(&self) -> Result<u64, QueueError>;
}

pub struct RedisJobQueue {
    conn: ConnectionManager,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("connected to broker");
        Ok(RedisJobQueue { conn })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, task: &TranscodeTask) -> Result<String, QueueError> {
        let task_id = Uuid::new_v4().to_string();
        let raw = serde_json::to_string(&Envelope {
            task_id: task_id.clone(),
            task: task.clone(),
        })?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(QUEUE_KEY, raw).await?;
        debug!(task_id = %task_id, job_id = task.job_id, "task enqueued");
        Ok(task_id)
    }

    async fn next(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .blmove(
                QUEUE_KEY,
                PROCESSING_KEY,
                redis::Direction::Right,
                redis::Direction::Left,
                POP_TIMEOUT_SECS,
            )
            .await?;
        match raw {
            Some(raw) => match Delivery::from_raw(raw.clone()) {
                Ok(delivery) => Ok(Some(delivery)),
                Err(e) => {
                    // Unparseable garbage would redeliver forever; drop it
                    warn!(error = %e, "dropping malformed queue entry");
                    let mut conn = self.conn.clone();
                    conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, raw).await?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.raw).await?;
        // Revocation flags are single-use; drop any leftover
        conn.srem::<_, _, ()>(CANCELLED_KEY, &delivery.task_id).await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(QUEUE_KEY, &delivery.raw).await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.raw).await?;
        Ok(())
    }

    async fn revoke(&self, task_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(CANCELLED_KEY, task_id).await?;

        // Best effort: if the envelope is still queued, remove it so no
        // worker even picks it up.
        let queued: Vec<String> = conn.lrange(QUEUE_KEY, 0, -1).await?;
        for raw in queued {
            if let Ok(delivery) = Delivery::from_raw(raw.clone()) {
                if delivery.task_id == task_id {
                    conn.lrem::<_, _, ()>(QUEUE_KEY, 1, raw).await?;
                    break;
                }
            }
        }
        info!(task_id, "task revoked");
        Ok(())
    }

    async fn is_cancelled(&self, task_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(CANCELLED_KEY, task_id).await?)
    }

    async fn publish_progress(&self, task_id: &str, progress: f64) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let event = serde_json::json!({ "task_id": task_id, "progress": progress });
        conn.publish::<_, _, ()>(PROGRESS_CHANNEL, event.to_string())
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn requeue_stale(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0u64;
        loop {
            let raw: Option<String> = conn
                .lmove(
                    PROCESSING_KEY,
                    QUEUE_KEY,
                    redis::Direction::Left,
                    redis::Direction::Right,
                )
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            warn!(moved, "requeued orphaned in-flight tasks");
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let raw = serde_json::to_string(&Envelope {
            task_id: "abc-123".to_string(),
            task: TranscodeTask {
                job_id: 9,
                file_id: 4,
                target_quality: 720,
            },
        })
        .unwrap();

        let delivery = Delivery::from_raw(raw).unwrap();
        assert_eq!(delivery.task_id, "abc-123");
        assert_eq!(
            delivery.task,
            TranscodeTask {
                job_id: 9,
                file_id: 4,
                target_quality: 720,
            }
        );
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(Delivery::from_raw("{not json".to_string()).is_err());
        assert!(Delivery::from_raw("{\"task_id\": \"x\"}".to_string()).is_err());
    }
}
