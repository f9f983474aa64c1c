//! WebSocket gateway for real-time chess matches.
//!
//! This service:
//! - Admits WebSocket connections identified by `x-user-id` (or `?user_id=`)
//! - Feeds inbound frames to the [`GameManager`](game_manager::GameManager)
//! - Writes outbound game messages and keepalive pings to the socket
//! - Optionally runs the persistence worker in process
//!
//! ## Architecture
//!
//! ```text
//! client ──ws──► read loop ──► GameManager ──► MoveQueue ──► PersistenceWorker ──► GameStore
//!    ▲                              │
//!    │                              ▼
//!    └──── send task ◄── Connection ◄── FanOut (NATS game.{id} / in-memory)
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod ws_server;

pub use backends::{connect_backends, EmbeddedWorker};
pub use config::{GatewayConfig, StorageBackend};
pub use error::{GatewayError, Result};
pub use ws_server::{create_router, AppState, HealthResponse, USER_ID_HEADER};
