// Test support utilities for both unit and integration tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use uuid::Uuid;

use crate::queue::{Delivery, JobQueue, QueueError, TranscodeTask};
use crate::storage::{
    ByteChunks, NetworkHint, ObjectInfo, ObjectStore, PresignGetOptions, StorageError,
};

/// In-memory object store for tests: a `HashMap` instead of S3.
#[derive(Default)]
pub struct MockObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant an object directly, simulating a client PUT via presigned URL.
    pub fn insert(&self, object_key: &str, data: Vec<u8>, content_type: &str) {
        self.objects.lock().unwrap().insert(
            object_key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn contains(&self, object_key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(object_key)
    }

    pub fn object(&self, object_key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(object_key)
            .map(|o| o.data.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

fn bytes_stream(data: Vec<u8>) -> ByteChunks {
    let chunks: Vec<Result<Bytes, StorageError>> = if data.is_empty() {
        Vec::new()
    } else {
        vec![Ok(Bytes::from(data))]
    };
    futures::stream::iter(chunks).boxed()
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn ensure_bucket(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn put(
        &self,
        object_key: &str,
        source: &Path,
        size: i64,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let data = tokio::fs::read(source).await?;
        assert_eq!(data.len() as i64, size, "declared size must match the file");
        self.insert(object_key, data, content_type);
        Ok(())
    }

    async fn stat(&self, object_key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(object_key)
            .map(|o| ObjectInfo {
                size: o.data.len() as i64,
                content_type: Some(o.content_type.clone()),
                etag: Some("\"mock-etag\"".to_string()),
                last_modified: Some(Utc::now()),
            }))
    }

    async fn get(&self, object_key: &str) -> Result<ByteChunks, StorageError> {
        let data = self
            .object(object_key)
            .ok_or_else(|| StorageError::NotFound(object_key.to_string()))?;
        Ok(bytes_stream(data))
    }

    async fn get_range(
        &self,
        object_key: &str,
        offset: u64,
        length: u64,
    ) -> Result<ByteChunks, StorageError> {
        let data = self
            .object(object_key)
            .ok_or_else(|| StorageError::NotFound(object_key.to_string()))?;
        let start = (offset as usize).min(data.len());
        let end = if length == 0 {
            data.len()
        } else {
            (start + length as usize).min(data.len())
        };
        Ok(bytes_stream(data[start..end].to_vec()))
    }

    async fn delete(&self, object_key: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(object_key);
        Ok(())
    }

    async fn presign_put(
        &self,
        object_key: &str,
        hint: NetworkHint,
    ) -> Result<String, StorageError> {
        Ok(format!(
            "http://mock-s3.local/test-bucket/{}?X-Amz-Signature=mock&network={:?}",
            object_key, hint
        ))
    }

    async fn presign_get(
        &self,
        object_key: &str,
        hint: NetworkHint,
        _options: PresignGetOptions,
    ) -> Result<String, StorageError> {
        Ok(format!(
            "http://mock-s3.local/test-bucket/{}?X-Amz-Signature=mock&network={:?}&verb=GET",
            object_key, hint
        ))
    }
}

/// In-memory queue with the same at-least-once surface as the Redis one.
#[derive(Default)]
pub struct InMemoryJobQueue {
    queue: Mutex<VecDeque<String>>,
    processing: Mutex<Vec<String>>,
    cancelled: Mutex<HashSet<String>>,
    progress: Mutex<Vec<(String, f64)>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_revoked(&self, task_id: &str) -> bool {
        self.cancelled.lock().unwrap().contains(task_id)
    }

    pub fn progress_events(&self) -> Vec<(String, f64)> {
        self.progress.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, task: &TranscodeTask) -> Result<String, QueueError> {
        let task_id = Uuid::new_v4().to_string();
        let raw = serde_json::json!({ "task_id": task_id, "task": task }).to_string();
        self.queue.lock().unwrap().push_back(raw);
        Ok(task_id)
    }

    async fn next(&self) -> Result<Option<Delivery>, QueueError> {
        let raw = self.queue.lock().unwrap().pop_front();
        match raw {
            Some(raw) => {
                self.processing.lock().unwrap().push(raw.clone());
                Ok(Some(Delivery::from_raw(raw)?))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.processing.lock().unwrap().retain(|raw| raw != &delivery.raw);
        self.cancelled.lock().unwrap().remove(&delivery.task_id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.processing.lock().unwrap().retain(|raw| raw != &delivery.raw);
        self.queue.lock().unwrap().push_back(delivery.raw.clone());
        Ok(())
    }

    async fn revoke(&self, task_id: &str) -> Result<(), QueueError> {
        self.cancelled.lock().unwrap().insert(task_id.to_string());
        let mut queue = self.queue.lock().unwrap();
        if let Some(index) = queue.iter().position(|raw| {
            Delivery::from_raw(raw.clone())
                .map(|d| d.task_id == task_id)
                .unwrap_or(false)
        }) {
            queue.remove(index);
        }
        Ok(())
    }

    async fn is_cancelled(&self, task_id: &str) -> Result<bool, QueueError> {
        Ok(self.cancelled.lock().unwrap().contains(task_id))
    }

    async fn publish_progress(&self, task_id: &str, progress: f64) -> Result<(), QueueError> {
        self.progress
            .lock()
            .unwrap()
            .push((task_id.to_string(), progress));
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn requeue_stale(&self) -> Result<u64, QueueError> {
        let mut processing = self.processing.lock().unwrap();
        let mut queue = self.queue.lock().unwrap();
        let moved = processing.len() as u64;
        for raw in processing.drain(..) {
            queue.push_back(raw);
        }
        Ok(moved)
    }
}
