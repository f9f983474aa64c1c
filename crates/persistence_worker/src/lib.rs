//! Persistence worker: moves accepted on the hot path land in the store here.
//!
//! ```text
//! GameManager ──LPUSH──► moves_queue ──BRPOP──► PersistenceWorker ──► GameStore
//!                                                      │
//!                                                      └──► moves_dead_letter
//! ```
//!
//! The queue is at-least-once and `insert_move` is idempotent per
//! `(game_id, move_number)`, so redelivered payloads are harmless.

pub mod error;
pub mod worker;

pub use error::{Error, Result};
pub use worker::{PersistenceWorker, ProcessOutcome, WorkerConfig};
