//! Persistence worker entry point.
//!
//! Drains `moves_queue` into the Redis game store.

use anyhow::Result;
use game_store::{RedisGameStore, RedisMoveQueue};
use metrics_exporter_prometheus::PrometheusBuilder;
use persistence_worker::{PersistenceWorker, WorkerConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting persistence worker...");

    // Initialize Prometheus metrics
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9092".into())
        .parse()
        .unwrap_or(9092);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;

    info!(
        "Prometheus metrics available at http://0.0.0.0:{}/metrics",
        metrics_port
    );

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    let config = WorkerConfig::from_env()?;

    info!("Configuration:");
    info!("  REDIS_URL: {}", redis_url);
    info!("  retry_delay: {:?}", config.retry_delay);
    info!("  max_insert_attempts: {}", config.max_insert_attempts);

    let queue = Arc::new(RedisMoveQueue::new(&redis_url)?);
    let store = Arc::new(RedisGameStore::new(&redis_url)?);

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let worker = PersistenceWorker::new(queue, store, config, shutdown_rx);

    let worker_handle = tokio::spawn(async move {
        if let Err(e) = worker.run().await {
            error!("Persistence worker failed: {:?}", e);
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(()).await;
    let _ = worker_handle.await;

    info!("Persistence worker stopped");
    Ok(())
}
