//! Transcoding pipeline: presets, probing, the encoder driver, and the
//! worker control flow that ties them to the catalog, queue, and store.

pub mod encoder;
pub mod presets;
pub mod probe;
pub mod worker;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::queue::QueueError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("probe failed: {0}")]
    Probe(String),
    #[error("encoder failed: {0}")]
    Encoder(String),
    #[error("cancelled")]
    Cancelled,
    #[error("time limit exceeded")]
    TimeLimitExceeded,
}
