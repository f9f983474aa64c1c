//! Game manager error types.
//!
//! Policy and protocol errors carry the exact message sent to the client.

use thiserror::Error;

/// Game manager error type.
#[derive(Debug, Error)]
pub enum GameError {
    /// Move submitted to a match that is no longer in progress.
    #[error("game has already ended")]
    GameEnded,

    #[error("move cannot be empty")]
    EmptyMove,

    /// Mover is neither white nor black in the match.
    #[error("you are not in this game")]
    NotAParticipant,

    #[error("not your turn")]
    NotYourTurn,

    /// The rules engine could not decode or apply the notation.
    #[error("invalid move format")]
    IllegalMove { notation: String },

    #[error("you are already in an active game")]
    AlreadyInGame,

    #[error("already waiting for opponent")]
    AlreadyWaiting,

    #[error("you cannot play against yourself")]
    SelfPlay,

    #[error("you are not in a game")]
    NotInGame,

    /// Admission rejected: no resolved user id.
    #[error("authentication required")]
    AuthenticationRequired,

    /// Persisted move history could not be replayed.
    #[error("failed to restore game")]
    RestoreFailed { game_id: String },

    #[error("invalid message format")]
    InvalidMessage,

    #[error("unknown message type")]
    UnknownMessageType(String),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] game_store::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Fan-out broker error (for compatibility with nats_client).
    #[error("Broker error: {0}")]
    Broker(#[from] anyhow::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GameError {
    /// Policy and protocol errors: reported to the client, never fatal.
    pub fn is_policy(&self) -> bool {
        !matches!(
            self,
            GameError::Store(_) | GameError::Json(_) | GameError::Broker(_) | GameError::Internal(_)
        )
    }
}

/// Result type for game manager operations.
pub type Result<T> = std::result::Result<T, GameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages() {
        assert_eq!(GameError::NotYourTurn.to_string(), "not your turn");
        assert_eq!(
            GameError::IllegalMove {
                notation: "e2e5".into()
            }
            .to_string(),
            "invalid move format"
        );
        assert_eq!(
            GameError::UnknownMessageType("resign".into()).to_string(),
            "unknown message type"
        );
    }

    #[test]
    fn test_policy_classification() {
        assert!(GameError::AlreadyWaiting.is_policy());
        assert!(GameError::InvalidMessage.is_policy());
        assert!(!GameError::Internal("boom".into()).is_policy());
        assert!(!GameError::Store(game_store::Error::NotFound("g".into())).is_policy());
    }
}
