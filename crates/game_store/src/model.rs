//! Records shared by the orchestrator, the store and the persistence worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque user identifier issued by the authentication collaborator.
pub type UserId = String;

/// Match identifier (UUID string).
pub type GameId = String;

/// Lifecycle of a match.
///
/// `InProgress` is the only non-terminal state; see [`GameStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    InProgress,
    Completed,
    Abandoned,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::InProgress => "in_progress",
            GameStatus::Completed => "completed",
            GameStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GameStatus::InProgress)
    }

    /// Transition table: InProgress -> Completed | Abandoned, nothing else.
    pub fn can_transition_to(&self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (GameStatus::InProgress, GameStatus::Completed)
                | (GameStatus::InProgress, GameStatus::Abandoned)
        )
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable match row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: GameId,
    pub white_user_id: UserId,
    pub black_user_id: UserId,
    pub status: GameStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl GameRecord {
    /// Create an in-progress record.
    pub fn new(
        id: impl Into<GameId>,
        white_user_id: impl Into<UserId>,
        black_user_id: impl Into<UserId>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            white_user_id: white_user_id.into(),
            black_user_id: black_user_id.into(),
            status: GameStatus::InProgress,
            outcome: None,
            method: None,
            started_at,
            ended_at: None,
        }
    }

    pub fn has_player(&self, user_id: &str) -> bool {
        self.white_user_id == user_id || self.black_user_id == user_id
    }

    /// Apply a final result to this record.
    pub fn apply_result(&mut self, result: &GameResult) {
        self.status = result.status;
        self.outcome = Some(result.outcome.clone());
        self.method = Some(result.method.clone());
        self.ended_at = Some(result.ended_at);
    }
}

/// Terminal result written when a match completes or is abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub status: GameStatus,
    /// "1-0", "0-1", "1/2-1/2" or "abandoned".
    pub outcome: String,
    /// Termination method, e.g. "Checkmate" or "disconnect".
    pub method: String,
    pub ended_at: DateTime<Utc>,
}

/// One accepted move, queued for asynchronous persistence.
///
/// Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    pub game_id: GameId,
    pub user_id: UserId,
    pub move_number: u32,
    #[serde(rename = "move")]
    pub notation: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl MovePayload {
    pub fn new(
        game_id: impl Into<GameId>,
        user_id: impl Into<UserId>,
        move_number: u32,
        notation: impl Into<String>,
    ) -> Self {
        Self {
            game_id: game_id.into(),
            user_id: user_id.into(),
            move_number,
            notation: notation.into(),
            created_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
