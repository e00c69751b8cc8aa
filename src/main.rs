use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use nebula::api::{self, AppState};
use nebula::catalog::Catalog;
use nebula::config::Settings;
use nebula::queue::RedisJobQueue;
use nebula::storage::{ObjectStore, S3ObjectStore};

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
    // Unreachable backend or bad credentials should stop the process here,
    // not on the first upload
    store.ensure_bucket().await?;
    let queue = RedisJobQueue::connect(&settings.redis_url).await?;

    let state = AppState {
        catalog,
        store: Arc::new(store),
        queue: Arc::new(queue),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Nebula API listening on {}", settings.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
