//! Durable FIFO move queue between the orchestrator and the persistence worker.
//!
//! Producers `push` serialized [`MovePayload`]s; a single consumer `pop`s them.
//! Delivery is at-least-once. Payloads the worker gives up on go to a
//! dead-letter list instead of being dropped.

use crate::error::Result;
use crate::model::MovePayload;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// Redis list holding pending moves.
pub const MOVES_QUEUE_KEY: &str = "moves_queue";

/// Redis list holding payloads the worker could not persist.
pub const DEAD_LETTER_KEY: &str = "moves_dead_letter";

/// Seconds a single BRPOP blocks before it is re-issued.
pub const DEFAULT_BLOCK_TIMEOUT_SECS: f64 = 5.0;

/// Move queue contract.
#[async_trait]
pub trait MoveQueue: Send + Sync {
    /// Enqueue one payload. Returns once the broker acknowledged it.
    async fn push(&self, payload: &MovePayload) -> Result<()>;

    /// Wait for the next raw payload. Never times out.
    async fn pop(&self) -> Result<String>;

    /// Park a payload that could not be processed.
    async fn dead_letter(&self, raw: &str) -> Result<()>;
}

/// Redis list queue: LPUSH producers, BRPOP consumer.
#[derive(Clone)]
pub struct RedisMoveQueue {
    client: Arc<redis::Client>,
    queue_key: String,
    dead_letter_key: String,
    block_timeout_secs: f64,
}

impl RedisMoveQueue {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self::from_client(Arc::new(client)))
    }

    pub fn from_client(client: Arc<redis::Client>) -> Self {
        Self {
            client,
            queue_key: MOVES_QUEUE_KEY.to_string(),
            dead_letter_key: DEAD_LETTER_KEY.to_string(),
            block_timeout_secs: DEFAULT_BLOCK_TIMEOUT_SECS,
        }
    }

    /// Use custom list names (e.g. one queue per deployment).
    pub fn with_keys(mut self, queue_key: impl Into<String>, dead_letter_key: impl Into<String>) -> Self {
        self.queue_key = queue_key.into();
        self.dead_letter_key = dead_letter_key.into();
        self
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }
}

#[async_trait]
impl MoveQueue for RedisMoveQueue {
    async fn push(&self, payload: &MovePayload) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let json = payload.to_json()?;
        conn.lpush::<_, _, ()>(&self.queue_key, &json).await?;
        debug!(
            "Enqueued move {} of game '{}'",
            payload.move_number, payload.game_id
        );
        Ok(())
    }

    async fn pop(&self) -> Result<String> {
        // BRPOP on its own connection so it never stalls pushes.
        let mut conn = self.get_connection().await?;
        loop {
            let popped: Option<(String, String)> =
                conn.brpop(&self.queue_key, self.block_timeout_secs).await?;
            if let Some((_, raw)) = popped {
                return Ok(raw);
            }
        }
    }

    async fn dead_letter(&self, raw: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        conn.lpush::<_, _, ()>(&self.dead_letter_key, raw).await?;
        Ok(())
    }
}

/// In-process queue for tests and single-instance development.
#[derive(Debug, Default)]
pub struct MemoryMoveQueue {
    items: Mutex<VecDeque<String>>,
    dead: Mutex<Vec<String>>,
    notify: Notify,
}

impl MemoryMoveQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a raw (possibly malformed) item.
    pub fn push_raw(&self, raw: impl Into<String>) {
        if let Ok(mut items) = self.items.lock() {
            items.push_back(raw.into());
        }
        self.notify.notify_one();
    }

    /// Pending items, oldest first.
    pub fn pending(&self) -> Vec<String> {
        self.items
            .lock()
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items parked in the dead-letter list.
    pub fn dead_letters(&self) -> Vec<String> {
        self.dead.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MoveQueue for MemoryMoveQueue {
    async fn push(&self, payload: &MovePayload) -> Result<()> {
        self.push_raw(payload.to_json()?);
        Ok(())
    }

    async fn pop(&self) -> Result<String> {
        loop {
            let next = self.items.lock().ok().and_then(|mut items| items.pop_front());
            if let Some(raw) = next {
                return Ok(raw);
            }
            self.notify.notified().await;
        }
    }

    async fn dead_letter(&self, raw: &str) -> Result<()> {
        if let Ok(mut dead) = self.dead.lock() {
            dead.push(raw.to_string());
        }
        Ok(())
    }
}
