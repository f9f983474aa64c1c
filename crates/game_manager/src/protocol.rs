//! WebSocket protocol message types.
//!
//! Every frame is a JSON object with a `type` discriminator.

use crate::error::{GameError, Result};
use crate::rules::Side;
use game_store::{GameResult, MovePayload};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Enter matchmaking.
    InitGame,
    /// Submit a move in coordinate notation.
    Move { notation: String },
}

/// Raw frame. Parsed loosely so an unknown `type` can be told apart
/// from malformed JSON.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "move")]
    notation: Option<String>,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|_| GameError::InvalidMessage)?;

        match envelope.kind.as_str() {
            "init_game" => Ok(ClientMessage::InitGame),
            "move" => Ok(ClientMessage::Move {
                notation: envelope.notation.unwrap_or_default(),
            }),
            other => Err(GameError::UnknownMessageType(other.to_string())),
        }
    }
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Match paired; tells the player their color.
    GameStart { color: Side, game_id: String },
    /// Requester took the matchmaking slot.
    Waiting { message: String },
    /// An accepted move, relayed through the fan-out broker.
    Move {
        #[serde(rename = "move")]
        notation: String,
    },
    /// Full move history after a reconnect or restore.
    BoardReplay { moves: Vec<MovePayload> },
    /// Match finished or abandoned.
    GameOver { outcome: String, method: String },
    /// Error message.
    Error { message: String },
}

impl ServerMessage {
    pub fn waiting() -> Self {
        ServerMessage::Waiting {
            message: "waiting for opponent".to_string(),
        }
    }

    pub fn error(err: &GameError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    pub fn game_over(result: &GameResult) -> Self {
        ServerMessage::GameOver {
            outcome: result.outcome.clone(),
            method: result.method.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
