//! Queue consumer loop.

use crate::error::{Error, Result};
use game_store::{GameStore, MovePayload, MoveQueue};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for the persistence worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause after a failed pop before trying again.
    pub retry_delay: Duration,
    /// Insert attempts per payload before it is dead-lettered.
    pub max_insert_attempts: u32,
    /// Base backoff between insert attempts, multiplied by the attempt number.
    pub insert_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            max_insert_attempts: 3,
            insert_backoff: Duration::from_millis(200),
        }
    }
}

impl WorkerConfig {
    /// Read `WORKER_RETRY_DELAY_MS` and `WORKER_MAX_INSERT_ATTEMPTS`, falling
    /// back to defaults when unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var("WORKER_RETRY_DELAY_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid WORKER_RETRY_DELAY_MS: {}", raw)))?;
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Ok(raw) = std::env::var("WORKER_MAX_INSERT_ATTEMPTS") {
            config.max_insert_attempts = raw.parse().map_err(|_| {
                Error::Config(format!("invalid WORKER_MAX_INSERT_ATTEMPTS: {}", raw))
            })?;
        }
        Ok(config)
    }
}

/// What happened to one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Persisted,
    DeadLettered,
}

/// Drains the move queue into the store.
pub struct PersistenceWorker {
    queue: Arc<dyn MoveQueue>,
    store: Arc<dyn GameStore>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
}

impl PersistenceWorker {
    pub fn new(
        queue: Arc<dyn MoveQueue>,
        store: Arc<dyn GameStore>,
        config: WorkerConfig,
        shutdown_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            queue,
            store,
            config,
            shutdown_rx,
        }
    }

    /// Run until the shutdown signal. Queue errors never stop the loop.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Starting persistence worker (max {} insert attempts)",
            self.config.max_insert_attempts
        );

        loop {
            tokio::select! {
                biased;  // Prioritize shutdown signal

                _ = self.shutdown_rx.recv() => {
                    info!("Persistence worker received shutdown signal");
                    break;
                }

                popped = self.queue.pop() => {
                    match popped {
                        Ok(raw) => {
                            self.process(&raw).await;
                        }
                        Err(e) => {
                            error!("Failed to pop from move queue: {}", e);
                            counter!("chess_worker_queue_errors_total").increment(1);
                            tokio::time::sleep(self.config.retry_delay).await;
                        }
                    }
                }
            }
        }

        info!("Persistence worker stopped");
        Ok(())
    }

    /// Persist one raw queue item, retrying transient store failures.
    pub async fn process(&self, raw: &str) -> ProcessOutcome {
        let payload = match MovePayload::from_json(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Undecodable move payload: {}", e);
                self.dead_letter(raw).await;
                return ProcessOutcome::DeadLettered;
            }
        };

        let max_attempts = self.config.max_insert_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.insert_move(&payload).await {
                Ok(()) => {
                    counter!("chess_worker_moves_persisted_total").increment(1);
                    debug!(
                        "Persisted move {} of game {}",
                        payload.move_number, payload.game_id
                    );
                    return ProcessOutcome::Persisted;
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "Insert of move {} for game {} failed (attempt {}/{}): {}",
                        payload.move_number, payload.game_id, attempt, max_attempts, e
                    );
                    tokio::time::sleep(self.config.insert_backoff * attempt).await;
                }
                Err(e) => {
                    error!(
                        "Giving up on move {} for game {} after {} attempts: {}",
                        payload.move_number, payload.game_id, attempt, e
                    );
                    self.dead_letter(raw).await;
                    return ProcessOutcome::DeadLettered;
                }
            }
        }
    }

    async fn dead_letter(&self, raw: &str) {
        counter!("chess_worker_dead_letters_total").increment(1);
        if let Err(e) = self.queue.dead_letter(raw).await {
            error!("Failed to dead-letter payload, dropping it: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use game_store::{GameRecord, GameResult, MemoryGameStore, MemoryMoveQueue};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store whose first `failures` inserts fail.
    struct FlakyStore {
        inner: MemoryGameStore,
        failures: AtomicU32,
        attempts: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryGameStore::new(),
                failures: AtomicU32::new(failures),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GameStore for FlakyStore {
        async fn create_game(&self, record: &GameRecord) -> game_store::Result<()> {
            self.inner.create_game(record).await
        }

        async fn get_game(&self, game_id: &str) -> game_store::Result<Option<GameRecord>> {
            self.inner.get_game(game_id).await
        }

        async fn find_active_game_for_user(
            &self,
            user_id: &str,
        ) -> game_store::Result<Option<GameRecord>> {
            self.inner.find_active_game_for_user(user_id).await
        }

        async fn update_game_result(
            &self,
            game_id: &str,
            result: &GameResult,
        ) -> game_store::Result<()> {
            self.inner.update_game_result(game_id, result).await
        }

        async fn insert_move(&self, payload: &MovePayload) -> game_store::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(game_store::Error::Internal("connection reset".into()));
            }
            self.inner.insert_move(payload).await
        }

        async fn list_moves(&self, game_id: &str) -> game_store::Result<Vec<MovePayload>> {
            self.inner.list_moves(game_id).await
        }
    }

    fn worker(
        queue: Arc<MemoryMoveQueue>,
        store: Arc<FlakyStore>,
    ) -> (PersistenceWorker, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = PersistenceWorker::new(queue, store, WorkerConfig::default(), shutdown_rx);
        (worker, shutdown_tx)
    }

    #[tokio::test]
    async fn test_persists_payload() {
        let queue = Arc::new(MemoryMoveQueue::new());
        let store = Arc::new(FlakyStore::new(0));
        let (worker, _tx) = worker(queue.clone(), store.clone());

        let raw = MovePayload::new("g1", "alice", 1, "e2e4").to_json().unwrap();
        assert_eq!(worker.process(&raw).await, ProcessOutcome::Persisted);
        assert_eq!(store.inner.move_count("g1"), 1);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_does_not_duplicate() {
        let queue = Arc::new(MemoryMoveQueue::new());
        let store = Arc::new(FlakyStore::new(0));
        let (worker, _tx) = worker(queue, store.clone());

        let raw = MovePayload::new("g1", "alice", 1, "e2e4").to_json().unwrap();
        worker.process(&raw).await;
        worker.process(&raw).await;
        assert_eq!(store.inner.move_count("g1"), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered() {
        let queue = Arc::new(MemoryMoveQueue::new());
        let store = Arc::new(FlakyStore::new(0));
        let (worker, _tx) = worker(queue.clone(), store.clone());

        assert_eq!(worker.process("{oops").await, ProcessOutcome::DeadLettered);
        assert_eq!(queue.dead_letters(), vec!["{oops".to_string()]);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let queue = Arc::new(MemoryMoveQueue::new());
        let store = Arc::new(FlakyStore::new(2));
        let (worker, _tx) = worker(queue.clone(), store.clone());

        let raw = MovePayload::new("g1", "bob", 2, "e7e5").to_json().unwrap();
        assert_eq!(worker.process(&raw).await, ProcessOutcome::Persisted);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.move_count("g1"), 1);
        assert!(queue.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_dead_letter() {
        let queue = Arc::new(MemoryMoveQueue::new());
        let store = Arc::new(FlakyStore::new(10));
        let (worker, _tx) = worker(queue.clone(), store.clone());

        let raw = MovePayload::new("g1", "bob", 2, "e7e5").to_json().unwrap();
        assert_eq!(worker.process(&raw).await, ProcessOutcome::DeadLettered);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.dead_letters(), vec![raw]);
        assert_eq!(store.inner.move_count("g1"), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let queue = Arc::new(MemoryMoveQueue::new());
        let store = Arc::new(FlakyStore::new(0));
        let (worker, shutdown_tx) = worker(queue.clone(), store.clone());

        for (n, m) in [(1, "e2e4"), (2, "e7e5"), (3, "g1f3")] {
            let user = if n % 2 == 1 { "alice" } else { "bob" };
            queue.push(&MovePayload::new("g1", user, n, m)).await.unwrap();
        }

        let handle = tokio::spawn(worker.run());
        for _ in 0..100 {
            if store.inner.move_count("g1") == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.inner.move_count("g1"), 3);

        shutdown_tx.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop")
            .unwrap()
            .unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.retry_delay, Duration::from_secs(1));
        assert_eq!(config.max_insert_attempts, 3);
    }
}
