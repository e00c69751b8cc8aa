//! Transcoder worker process: consumes transcode tasks from the queue and
//! runs them with bounded concurrency. Failures never crash the process;
//! they become `failed` job rows.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nebula::catalog::Catalog;
use nebula::config::Settings;
use nebula::queue::{JobQueue, RedisJobQueue};
use nebula::storage::{ObjectStore, S3ObjectStore};
use nebula::transcoder::worker::TranscoderContext;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if dotenvy::dotenv().is_ok() {
        println!("Loaded environment from .env");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env()?;

    let catalog = Catalog::new(&settings.database_url).await?;
    let store = S3ObjectStore::new(&settings.s3).await?;
    store.ensure_bucket().await?;
    let queue: Arc<dyn JobQueue> = Arc::new(RedisJobQueue::connect(&settings.redis_url).await?);

    // A previous worker may have died mid-job; its in-flight envelopes go
    // back on the queue and the idempotent handler sorts out duplicates.
    queue.requeue_stale().await?;

    let context = Arc::new(TranscoderContext::new(
        catalog,
        Arc::new(store),
        Arc::clone(&queue),
        &settings.worker,
    ));

    let concurrency = settings.worker.concurrency.max(1);
    info!(concurrency, "transcoder worker started");

    let mut consumers = Vec::new();
    for index in 0..concurrency {
        let context = Arc::clone(&context);
        let queue = Arc::clone(&queue);
        consumers.push(tokio::spawn(consume_loop(index, context, queue)));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    for consumer in consumers {
        consumer.abort();
    }
    Ok(())
}

async fn consume_loop(index: usize, context: Arc<TranscoderContext>, queue: Arc<dyn JobQueue>) {
    loop {
        match queue.next().await {
            Ok(Some(delivery)) => context.handle(delivery).await,
            Ok(None) => {} // idle poll timeout, go around
            Err(e) => {
                error!(worker = index, error = %e, "queue receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
