//! Durable storage for chess matches.
//!
//! - [`GameStore`]: match records and move history
//! - [`MoveQueue`]: at-least-once FIFO between move acceptance and persistence
//!
//! Both have a Redis implementation for production and an in-memory one
//! for tests and single-process runs.

pub mod error;
pub mod model;
pub mod queue;
pub mod redis_store;
pub mod store;

pub use error::{Error, Result};
pub use model::{GameId, GameRecord, GameResult, GameStatus, MovePayload, UserId};
pub use queue::{MemoryMoveQueue, MoveQueue, RedisMoveQueue, DEAD_LETTER_KEY, MOVES_QUEUE_KEY};
pub use redis_store::RedisGameStore;
pub use store::{GameStore, MemoryGameStore};
