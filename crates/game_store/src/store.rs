//! Persistent store contract for match and move records.
//!
//! The orchestrator creates and reads matches; the persistence worker appends
//! moves. [`MemoryGameStore`] backs tests and single-process development runs.

use crate::error::{Error, Result};
use crate::model::{GameRecord, GameResult, GameStatus, MovePayload};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Read/write contract the orchestrator and worker need from durable storage.
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Persist a newly created match.
    async fn create_game(&self, record: &GameRecord) -> Result<()>;

    /// Fetch a match by id.
    async fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>>;

    /// Most recently started in-progress match the user plays in, if any.
    async fn find_active_game_for_user(&self, user_id: &str) -> Result<Option<GameRecord>>;

    /// Write the terminal status, outcome, method and end time.
    async fn update_game_result(&self, game_id: &str, result: &GameResult) -> Result<()>;

    /// Insert a move row keyed by `(game_id, move_number)`.
    ///
    /// Re-inserting the same key replaces the row, so redelivery is harmless.
    async fn insert_move(&self, payload: &MovePayload) -> Result<()>;

    /// All moves of a match ordered by move number.
    async fn list_moves(&self, game_id: &str) -> Result<Vec<MovePayload>>;
}

/// In-memory store using DashMap.
#[derive(Debug, Clone, Default)]
pub struct MemoryGameStore {
    inner: Arc<MemoryGameStoreInner>,
}

#[derive(Debug, Default)]
struct MemoryGameStoreInner {
    games: DashMap<String, GameRecord>,
    moves: DashMap<String, BTreeMap<u32, MovePayload>>,
}

impl MemoryGameStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored matches.
    pub fn game_count(&self) -> usize {
        self.inner.games.len()
    }

    /// Number of stored moves for a match.
    pub fn move_count(&self, game_id: &str) -> usize {
        self.inner.moves.get(game_id).map(|m| m.len()).unwrap_or(0)
    }
}

#[async_trait]
impl GameStore for MemoryGameStore {
    async fn create_game(&self, record: &GameRecord) -> Result<()> {
        self.inner.games.insert(record.id.clone(), record.clone());
        debug!("Stored game {}", record.id);
        Ok(())
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>> {
        Ok(self.inner.games.get(game_id).map(|g| g.clone()))
    }

    async fn find_active_game_for_user(&self, user_id: &str) -> Result<Option<GameRecord>> {
        Ok(self
            .inner
            .games
            .iter()
            .filter(|g| g.status == GameStatus::InProgress && g.has_player(user_id))
            .max_by_key(|g| g.started_at)
            .map(|g| g.clone()))
    }

    async fn update_game_result(&self, game_id: &str, result: &GameResult) -> Result<()> {
        let mut record = self
            .inner
            .games
            .get_mut(game_id)
            .ok_or_else(|| Error::NotFound(game_id.to_string()))?;
        record.apply_result(result);
        Ok(())
    }

    async fn insert_move(&self, payload: &MovePayload) -> Result<()> {
        self.inner
            .moves
            .entry(payload.game_id.clone())
            .or_default()
            .insert(payload.move_number, payload.clone());
        Ok(())
    }

    async fn list_moves(&self, game_id: &str) -> Result<Vec<MovePayload>> {
        Ok(self
            .inner
            .moves
            .get(game_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_find_active_game_prefers_latest_in_progress() {
        let store = MemoryGameStore::new();
        let now = Utc::now();

        let older = GameRecord::new("old", "alice", "bob", now - Duration::minutes(10));
        let newer = GameRecord::new("new", "carol", "alice", now);
        let mut finished = GameRecord::new("done", "alice", "dave", now + Duration::minutes(1));
        finished.status = GameStatus::Completed;

        for record in [&older, &newer, &finished] {
            store.create_game(record).await.unwrap();
        }

        let found = store.find_active_game_for_user("alice").await.unwrap();
        assert_eq!(found.map(|g| g.id), Some("new".to_string()));
        assert!(store.find_active_game_for_user("erin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_moves_ordered_and_idempotent() {
        let store = MemoryGameStore::new();
        store.insert_move(&MovePayload::new("g1", "bob", 2, "e7e5")).await.unwrap();
        store.insert_move(&MovePayload::new("g1", "alice", 1, "e2e4")).await.unwrap();
        store.insert_move(&MovePayload::new("g1", "alice", 1, "e2e4")).await.unwrap();

        let moves = store.list_moves("g1").await.unwrap();
        let notations: Vec<&str> = moves.iter().map(|m| m.notation.as_str()).collect();
        assert_eq!(notations, vec!["e2e4", "e7e5"]);
        assert_eq!(store.move_count("g1"), 2);
        assert!(store.list_moves("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_result() {
        let store = MemoryGameStore::new();
        store
            .create_game(&GameRecord::new("g1", "alice", "bob", Utc::now()))
            .await
            .unwrap();

        let result = GameResult {
            status: GameStatus::Completed,
            outcome: "1-0".to_string(),
            method: "Checkmate".to_string(),
            ended_at: Utc::now(),
        };
        store.update_game_result("g1", &result).await.unwrap();

        let record = store.get_game("g1").await.unwrap().unwrap();
        assert_eq!(record.status, GameStatus::Completed);
        assert_eq!(record.outcome.as_deref(), Some("1-0"));
        assert!(store.find_active_game_for_user("alice").await.unwrap().is_none());

        let missing = store.update_game_result("nope", &result).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }
}
