//! Real-time session and match orchestrator for two-player chess.
//!
//! This crate provides:
//! - `GameManager`: sessions, one-slot matchmaking, move dispatch, grace-period abandonment
//! - `Game`: per-match state machine over the shakmaty rules adapter
//! - `FanOut` trait with NATS and in-memory implementations
//! - WebSocket protocol types shared with the gateway
//!
//! # Architecture
//!
//! ```text
//!   connection read loop ──► GameManager::handle_message
//!                                   │
//!                  ┌────────────────┴───────────────┐
//!                  ▼                                ▼
//!             matchmaking                     Game::apply_move
//!          (pending slot)                           │
//!                                   ┌───────────────┼────────────────┐
//!                                   ▼               ▼                ▼
//!                              MoveQueue        FanOut topic     GameStore
//!                           (persistence     game.{game_id}    (on finish)
//!                              worker)              │
//!                                                   ▼
//!                                      fan-out listener ──► both players
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use game_manager::{Backends, Connection, GameManager, GameManagerConfig};
//! use std::sync::Arc;
//!
//! let manager = Arc::new(GameManager::new(Backends::in_memory(), GameManagerConfig::default()));
//!
//! let (conn, mut outbound) = Connection::channel();
//! manager.connect("alice", conn.clone()).await?;
//! manager.handle_message("alice", &conn, r#"{"type":"init_game"}"#).await;
//! ```

pub mod connection;
pub mod error;
pub mod fanout;
pub mod game;
pub mod manager;
pub mod protocol;
pub mod rules;
pub mod session;

pub use connection::{Connection, ConnectionId, Outbound, CONNECTION_CHANNEL_BUFFER_SIZE};
pub use error::{GameError, Result};
pub use fanout::{game_topic, FanOut, MemoryFanOut, NatsFanOut, PayloadStream};
pub use game::{Game, GameSnapshot, MoveOutcome};
pub use manager::{Backends, GameManager, GameManagerConfig, DEFAULT_GRACE_PERIOD};
pub use protocol::{ClientMessage, ServerMessage};
pub use rules::{ChessBoard, Outcome, RulesError, Side, Termination};
pub use session::{PlayerSession, SessionRegistry, SessionSnapshot};
