//! A single match: board, lifecycle and move validation.
//!
//! All state sits behind one lock so concurrent submissions from both
//! players serialize and the move counter has no gaps.

use crate::error::{GameError, Result};
use crate::fanout::game_topic;
use crate::manager::Backends;
use crate::protocol::ServerMessage;
use crate::rules::{ChessBoard, Side};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use game_store::{GameId, GameRecord, GameResult, GameStatus, MovePayload, UserId};
use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Result of an accepted move.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// Game continues; the move was queued and published.
    Accepted { move_number: u32 },
    /// The move ended the game. Nothing was queued or published.
    Finished { notation: String, result: GameResult },
}

struct GameState {
    board: ChessBoard,
    status: GameStatus,
    move_number: u32,
    history: Vec<MovePayload>,
    ended_at: Option<DateTime<Utc>>,
    /// Participants currently inside a disconnect episode.
    disconnected: HashMap<UserId, DateTime<Utc>>,
}

impl GameState {
    fn new() -> Self {
        Self {
            board: ChessBoard::new(),
            status: GameStatus::InProgress,
            move_number: 0,
            history: Vec::new(),
            ended_at: None,
            disconnected: HashMap::new(),
        }
    }

    fn finish(&mut self, next: GameStatus) -> Option<DateTime<Utc>> {
        if !self.status.can_transition_to(next) {
            return None;
        }
        let now = Utc::now();
        self.status = next;
        self.ended_at = Some(now);
        Some(now)
    }
}

/// Read-only view of a match.
#[derive(Debug, Clone, Serialize)]
pub struct GameSnapshot {
    pub id: GameId,
    pub white_user_id: UserId,
    pub black_user_id: UserId,
    pub status: GameStatus,
    pub move_number: u32,
    pub side_to_move: Side,
    pub fen: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

pub struct Game {
    pub id: GameId,
    pub white_user_id: UserId,
    pub black_user_id: UserId,
    pub started_at: DateTime<Utc>,
    state: RwLock<GameState>,
    /// Held while a move is queued and published. Taken before the state
    /// lock is released, so dispatch follows move-number order.
    dispatch: Mutex<()>,
}

impl Game {
    /// New match in the starting position.
    pub fn new(white_user_id: impl Into<UserId>, black_user_id: impl Into<UserId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            white_user_id: white_user_id.into(),
            black_user_id: black_user_id.into(),
            started_at: Utc::now(),
            state: RwLock::new(GameState::new()),
            dispatch: Mutex::new(()),
        }
    }

    /// Rebuild a match from its record and persisted history.
    ///
    /// Moves are replayed in order; any gap or illegal move fails the restore.
    pub fn restore(record: &GameRecord, moves: &[MovePayload]) -> Result<Self> {
        let restore_failed = || GameError::RestoreFailed {
            game_id: record.id.clone(),
        };
        if record.status != GameStatus::InProgress {
            return Err(restore_failed());
        }

        let mut state = GameState::new();
        for (i, m) in moves.iter().enumerate() {
            if m.move_number != i as u32 + 1 {
                warn!(
                    "Game {} history has a gap: expected move {}, found {}",
                    record.id,
                    i + 1,
                    m.move_number
                );
                return Err(restore_failed());
            }
            if let Err(e) = state.board.play(&m.notation) {
                warn!("Game {} replay failed at move {}: {}", record.id, m.move_number, e);
                return Err(restore_failed());
            }
            state.move_number = m.move_number;
            state.history.push(m.clone());
        }

        Ok(Self {
            id: record.id.clone(),
            white_user_id: record.white_user_id.clone(),
            black_user_id: record.black_user_id.clone(),
            started_at: record.started_at,
            state: RwLock::new(state),
            dispatch: Mutex::new(()),
        })
    }

    pub fn topic(&self) -> String {
        game_topic(&self.id)
    }

    pub fn players(&self) -> [&str; 2] {
        [&self.white_user_id, &self.black_user_id]
    }

    pub fn color_of(&self, user_id: &str) -> Option<Side> {
        if user_id == self.white_user_id {
            Some(Side::White)
        } else if user_id == self.black_user_id {
            Some(Side::Black)
        } else {
            None
        }
    }

    /// In-progress record for persistence.
    pub fn record(&self) -> GameRecord {
        GameRecord::new(
            self.id.clone(),
            self.white_user_id.clone(),
            self.black_user_id.clone(),
            self.started_at,
        )
    }

    pub async fn status(&self) -> GameStatus {
        self.state.read().await.status
    }

    pub async fn is_active(&self) -> bool {
        self.status().await == GameStatus::InProgress
    }

    /// Accepted non-terminal moves so far, oldest first.
    pub async fn history(&self) -> Vec<MovePayload> {
        self.state.read().await.history.clone()
    }

    pub async fn snapshot(&self) -> GameSnapshot {
        let state = self.state.read().await;
        GameSnapshot {
            id: self.id.clone(),
            white_user_id: self.white_user_id.clone(),
            black_user_id: self.black_user_id.clone(),
            status: state.status,
            move_number: state.move_number,
            side_to_move: state.board.side_to_move(),
            fen: state.board.to_fen(),
            started_at: self.started_at,
            ended_at: state.ended_at,
        }
    }

    /// Validate and apply a move.
    ///
    /// Checks run in a fixed order: game ended, empty move, participant,
    /// turn, legality. Queue and fan-out failures are logged and counted
    /// but never undo an accepted move.
    pub async fn apply_move(
        &self,
        user_id: &str,
        notation: &str,
        backends: &Backends,
    ) -> Result<MoveOutcome> {
        let mut state = self.state.write().await;

        if state.status != GameStatus::InProgress {
            return Err(GameError::GameEnded);
        }
        let notation = notation.trim();
        if notation.is_empty() {
            return Err(GameError::EmptyMove);
        }
        let side = self.color_of(user_id).ok_or(GameError::NotAParticipant)?;
        if side != state.board.side_to_move() {
            return Err(GameError::NotYourTurn);
        }
        let illegal = || GameError::IllegalMove {
            notation: notation.to_string(),
        };
        let m = state.board.decode(notation).map_err(|_| illegal())?;
        state.board.apply(&m).map_err(|_| illegal())?;

        counter!("chess_moves_accepted_total").increment(1);

        if let Some(outcome) = state.board.outcome() {
            let ended_at = state
                .finish(GameStatus::Completed)
                .ok_or_else(|| GameError::Internal(format!("game {} already terminal", self.id)))?;
            let result = GameResult {
                status: GameStatus::Completed,
                outcome: outcome.result().to_string(),
                method: outcome.method.as_str().to_string(),
                ended_at,
            };
            // Earlier moves finish dispatching before the result goes out.
            let _dispatch = self.dispatch.lock().await;
            drop(state);

            if let Err(e) = backends.store.update_game_result(&self.id, &result).await {
                error!("Failed to persist result of game {}: {}", self.id, e);
                counter!("chess_store_failures_total", "op" => "update_game_result").increment(1);
            }
            info!(
                "Game {} finished: {} by {}",
                self.id, result.outcome, result.method
            );
            return Ok(MoveOutcome::Finished {
                notation: notation.to_string(),
                result,
            });
        }

        state.move_number += 1;
        let move_number = state.move_number;
        let payload = MovePayload::new(self.id.clone(), user_id, move_number, notation);
        state.history.push(payload.clone());

        // Queue and publish outside the state lock. The next move cannot
        // reach dispatch before this one releases it.
        let _dispatch = self.dispatch.lock().await;
        drop(state);

        if let Err(e) = backends.queue.push(&payload).await {
            warn!(
                "Failed to enqueue move {} of game {}: {}",
                move_number, self.id, e
            );
            counter!("chess_move_enqueue_failures_total").increment(1);
        }

        let published = ServerMessage::Move {
            notation: notation.to_string(),
        }
        .to_json();
        let published = match published {
            Ok(json) => backends
                .fanout
                .publish(&self.topic(), Bytes::from(json))
                .await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(
                "Failed to publish move {} of game {}: {}",
                move_number, self.id, e
            );
            counter!("chess_move_publish_failures_total").increment(1);
        }

        Ok(MoveOutcome::Accepted { move_number })
    }

    /// Record that a participant dropped. Returns true if the match is
    /// still in progress and a grace timer should be armed.
    pub async fn handle_disconnect(&self, user_id: &str) -> bool {
        let mut state = self.state.write().await;
        if state.status != GameStatus::InProgress || self.color_of(user_id).is_none() {
            return false;
        }
        state.disconnected.insert(user_id.to_string(), Utc::now());
        true
    }

    pub async fn handle_reconnect(&self, user_id: &str) {
        self.state.write().await.disconnected.remove(user_id);
    }

    pub async fn is_disconnected(&self, user_id: &str) -> bool {
        self.state.read().await.disconnected.contains_key(user_id)
    }

    /// Abandon the match. `None` if it already ended.
    pub async fn abandon(&self) -> Option<GameResult> {
        let mut state = self.state.write().await;
        let ended_at = state.finish(GameStatus::Abandoned)?;
        Some(GameResult {
            status: GameStatus::Abandoned,
            outcome: "abandoned".to_string(),
            method: "disconnect".to_string(),
            ended_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{FanOut, MemoryFanOut};
    use futures::StreamExt;
    use game_store::{GameStore, MemoryGameStore, MemoryMoveQueue};
    use std::sync::Arc;

    struct Fixture {
        store: MemoryGameStore,
        queue: Arc<MemoryMoveQueue>,
        fanout: Arc<MemoryFanOut>,
        backends: Backends,
    }

    fn fixture() -> Fixture {
        let store = MemoryGameStore::new();
        let queue = Arc::new(MemoryMoveQueue::new());
        let fanout = Arc::new(MemoryFanOut::new());
        let backends = Backends::new(Arc::new(store.clone()), queue.clone(), fanout.clone());
        Fixture {
            store,
            queue,
            fanout,
            backends,
        }
    }

    #[tokio::test]
    async fn test_accepts_move_and_fans_out() {
        let fx = fixture();
        let game = Game::new("alice", "bob");
        let mut sub = fx.fanout.subscribe(&game.topic()).await.unwrap();

        let outcome = game.apply_move("alice", "e2e4", &fx.backends).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Accepted { move_number: 1 });

        let queued = MovePayload::from_json(&fx.queue.pending()[0]).unwrap();
        assert_eq!(queued.game_id, game.id);
        assert_eq!(queued.user_id, "alice");
        assert_eq!(queued.move_number, 1);
        assert_eq!(queued.notation, "e2e4");

        let published = sub.next().await.unwrap();
        assert_eq!(&published[..], br#"{"type":"move","move":"e2e4"}"#);

        assert_eq!(game.history().await.len(), 1);
        assert_eq!(game.snapshot().await.side_to_move, Side::Black);
    }

    #[tokio::test]
    async fn test_rejections_in_order() {
        let fx = fixture();
        let game = Game::new("alice", "bob");

        assert!(matches!(
            game.apply_move("alice", "  ", &fx.backends).await,
            Err(GameError::EmptyMove)
        ));
        assert!(matches!(
            game.apply_move("carol", "e2e4", &fx.backends).await,
            Err(GameError::NotAParticipant)
        ));
        assert!(matches!(
            game.apply_move("bob", "e7e5", &fx.backends).await,
            Err(GameError::NotYourTurn)
        ));
        assert!(matches!(
            game.apply_move("alice", "e2e5", &fx.backends).await,
            Err(GameError::IllegalMove { .. })
        ));
        assert!(matches!(
            game.apply_move("alice", "xyz", &fx.backends).await,
            Err(GameError::IllegalMove { .. })
        ));

        // Nothing leaked
        assert!(fx.queue.is_empty());
        assert_eq!(game.snapshot().await.move_number, 0);
    }

    #[tokio::test]
    async fn test_checkmate_completes_without_queueing_final_move() {
        let fx = fixture();
        let game = Game::new("alice", "bob");
        fx.store.create_game(&game.record()).await.unwrap();

        for (user, m) in [("alice", "f2f3"), ("bob", "e7e5"), ("alice", "g2g4")] {
            game.apply_move(user, m, &fx.backends).await.unwrap();
        }
        let outcome = game.apply_move("bob", "d8h4", &fx.backends).await.unwrap();

        match outcome {
            MoveOutcome::Finished { notation, result } => {
                assert_eq!(notation, "d8h4");
                assert_eq!(result.outcome, "0-1");
                assert_eq!(result.method, "Checkmate");
            }
            other => panic!("expected finish, got {:?}", other),
        }
        assert_eq!(game.status().await, GameStatus::Completed);
        assert_eq!(fx.queue.len(), 3);
        assert_eq!(game.snapshot().await.move_number, 3);

        let stored = fx.store.get_game(&game.id).await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::Completed);
        assert_eq!(stored.outcome.as_deref(), Some("0-1"));

        assert!(matches!(
            game.apply_move("alice", "e2e4", &fx.backends).await,
            Err(GameError::GameEnded)
        ));
    }

    #[tokio::test]
    async fn test_abandon_only_once() {
        let game = Game::new("alice", "bob");
        assert!(game.handle_disconnect("alice").await);
        assert!(game.is_disconnected("alice").await);
        assert!(!game.handle_disconnect("carol").await);

        let result = game.abandon().await.unwrap();
        assert_eq!(result.outcome, "abandoned");
        assert_eq!(result.method, "disconnect");
        assert!(game.abandon().await.is_none());
        assert!(!game.handle_disconnect("bob").await);
    }

    #[tokio::test]
    async fn test_restore_replays_history() {
        let record = GameRecord::new("g1", "alice", "bob", Utc::now());
        let moves = vec![
            MovePayload::new("g1", "alice", 1, "e2e4"),
            MovePayload::new("g1", "bob", 2, "e7e5"),
        ];

        let game = Game::restore(&record, &moves).unwrap();
        let snapshot = game.snapshot().await;
        assert_eq!(snapshot.move_number, 2);
        assert_eq!(snapshot.side_to_move, Side::White);
        assert_eq!(game.history().await, moves);
    }

    #[tokio::test]
    async fn test_restore_rejects_bad_history() {
        let record = GameRecord::new("g1", "alice", "bob", Utc::now());

        let illegal = vec![MovePayload::new("g1", "alice", 1, "e2e5")];
        assert!(matches!(
            Game::restore(&record, &illegal),
            Err(GameError::RestoreFailed { .. })
        ));

        let gap = vec![
            MovePayload::new("g1", "alice", 1, "e2e4"),
            MovePayload::new("g1", "alice", 3, "d2d4"),
        ];
        assert!(Game::restore(&record, &gap).is_err());
    }

    /// Fan-out whose publishes wait for a permit.
    #[derive(Default)]
    struct GatedFanOut {
        gate: tokio::sync::Notify,
        inner: MemoryFanOut,
    }

    #[async_trait::async_trait]
    impl FanOut for GatedFanOut {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
            self.gate.notified().await;
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str) -> Result<crate::fanout::PayloadStream> {
            self.inner.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn test_slow_publish_does_not_hold_game_state() {
        let queue = Arc::new(MemoryMoveQueue::new());
        let fanout = Arc::new(GatedFanOut::default());
        let backends = Backends::new(
            Arc::new(MemoryGameStore::new()),
            queue.clone(),
            fanout.clone(),
        );
        let game = Arc::new(Game::new("alice", "bob"));
        let mut sub = fanout.inner.subscribe(&game.topic()).await.unwrap();

        let spawn_move = |user: &'static str, m: &'static str| {
            let game = game.clone();
            let backends = backends.clone();
            tokio::spawn(async move { game.apply_move(user, m, &backends).await })
        };

        let first = spawn_move("alice", "e2e4");
        for _ in 0..100 {
            if queue.len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.len(), 1);

        // Publish is parked, yet the match is readable and playable
        let snapshot = tokio::time::timeout(std::time::Duration::from_secs(1), game.snapshot())
            .await
            .expect("state lock should be free during publish");
        assert_eq!(snapshot.move_number, 1);
        assert_eq!(snapshot.side_to_move, Side::Black);

        let second = spawn_move("bob", "e7e5");
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        // Second move waits behind the first one's dispatch
        assert_eq!(queue.len(), 1);
        assert!(!first.is_finished());

        fanout.gate.notify_one();
        assert_eq!(
            first.await.unwrap().unwrap(),
            MoveOutcome::Accepted { move_number: 1 }
        );
        assert_eq!(&sub.next().await.unwrap()[..], br#"{"type":"move","move":"e2e4"}"#);

        fanout.gate.notify_one();
        assert_eq!(
            second.await.unwrap().unwrap(),
            MoveOutcome::Accepted { move_number: 2 }
        );
        assert_eq!(&sub.next().await.unwrap()[..], br#"{"type":"move","move":"e7e5"}"#);
        assert_eq!(queue.len(), 2);
    }
}
