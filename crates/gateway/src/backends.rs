//! Wiring of storage, queue and fan-out collaborators.

use crate::config::{GatewayConfig, StorageBackend};
use crate::error::Result;
use game_manager::{Backends, NatsFanOut};
use game_store::{RedisGameStore, RedisMoveQueue};
use nats_client::NatsClient;
use persistence_worker::PersistenceWorker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Connect the collaborators selected by `config.storage`.
pub async fn connect_backends(config: &GatewayConfig) -> Result<Backends> {
    match config.storage {
        StorageBackend::Memory => {
            info!("Using in-memory storage and fan-out (single instance)");
            Ok(Backends::in_memory())
        }
        StorageBackend::Redis => {
            info!("Connecting to Redis at {}", config.redis_url);
            let store = Arc::new(RedisGameStore::new(&config.redis_url)?);
            let queue = Arc::new(RedisMoveQueue::new(&config.redis_url)?);

            info!("Connecting to NATS at {}", config.nats_url);
            let nats = Arc::new(NatsClient::connect(&config.nats_url).await?);
            info!("Connected to NATS");

            Ok(Backends::new(store, queue, Arc::new(NatsFanOut::new(nats))))
        }
    }
}

/// A persistence worker running inside the gateway process.
pub struct EmbeddedWorker {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl EmbeddedWorker {
    /// Spawn a worker draining `backends.queue` into `backends.store`.
    pub fn spawn(backends: &Backends, config: &GatewayConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = PersistenceWorker::new(
            backends.queue.clone(),
            backends.store.clone(),
            config.worker.clone(),
            shutdown_rx,
        );

        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!("Persistence worker error: {:?}", e);
            }
        });

        Self {
            shutdown_tx,
            handle,
        }
    }

    pub async fn stop(self) {
        info!("Shutting down persistence worker...");
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use game_store::MovePayload;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_backends_with_embedded_worker() {
        let config = GatewayConfig {
            storage: StorageBackend::Memory,
            ..GatewayConfig::default()
        };
        let backends = connect_backends(&config).await.unwrap();
        let worker = EmbeddedWorker::spawn(&backends, &config);

        backends
            .queue
            .push(&MovePayload::new("g1", "alice", 1, "e2e4"))
            .await
            .unwrap();

        let mut persisted = Vec::new();
        for _ in 0..100 {
            persisted = backends.store.list_moves("g1").await.unwrap();
            if !persisted.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].notation, "e2e4");

        tokio::time::timeout(Duration::from_secs(1), worker.stop())
            .await
            .expect("worker should stop");
    }
}
