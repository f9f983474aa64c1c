//! Redis-backed match store.
//!
//! Key layout:
//! - `game:{game_id}` -> JSON [`GameRecord`]
//! - `user:{user_id}:games` -> sorted set of game ids scored by start time (ms)
//! - `game:{game_id}:moves` -> sorted set of JSON [`MovePayload`] scored by move number

use crate::error::{Error, Result};
use crate::model::{GameRecord, GameResult, GameStatus, MovePayload};
use crate::store::GameStore;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{debug, info};

/// Redis key prefix for match records: game:{game_id}
pub const GAME_KEY_PREFIX: &str = "game:";

/// Redis key prefix for per-user match indexes: user:{user_id}:games
pub const USER_KEY_PREFIX: &str = "user:";

fn game_key(game_id: &str) -> String {
    format!("{}{}", GAME_KEY_PREFIX, game_id)
}

fn moves_key(game_id: &str) -> String {
    format!("{}{}:moves", GAME_KEY_PREFIX, game_id)
}

fn user_games_key(user_id: &str) -> String {
    format!("{}{}:games", USER_KEY_PREFIX, user_id)
}

/// Match store on top of a shared Redis client.
#[derive(Clone)]
pub struct RedisGameStore {
    client: Arc<redis::Client>,
}

impl RedisGameStore {
    /// Create a new store.
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// Build from an already opened client.
    pub fn from_client(client: Arc<redis::Client>) -> Self {
        Self { client }
    }

    /// Get an async connection.
    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn)
    }

    async fn read_record(
        conn: &mut redis::aio::MultiplexedConnection,
        game_id: &str,
    ) -> Result<Option<GameRecord>> {
        let json: Option<String> = conn.get(game_key(game_id)).await?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl GameStore for RedisGameStore {
    async fn create_game(&self, record: &GameRecord) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(record)?;
        let score = record.started_at.timestamp_millis();

        let _: () = redis::pipe()
            .atomic()
            .set(game_key(&record.id), &json)
            .ignore()
            .zadd(user_games_key(&record.white_user_id), &record.id, score)
            .ignore()
            .zadd(user_games_key(&record.black_user_id), &record.id, score)
            .ignore()
            .query_async(&mut conn)
            .await?;

        info!(
            "Stored game '{}' (white: {}, black: {})",
            record.id, record.white_user_id, record.black_user_id
        );
        Ok(())
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<GameRecord>> {
        let mut conn = self.get_connection().await?;
        Self::read_record(&mut conn, game_id).await
    }

    async fn find_active_game_for_user(&self, user_id: &str) -> Result<Option<GameRecord>> {
        let mut conn = self.get_connection().await?;
        let ids: Vec<String> = conn.zrevrange(user_games_key(user_id), 0, -1).await?;

        for id in ids {
            if let Some(record) = Self::read_record(&mut conn, &id).await? {
                if record.status == GameStatus::InProgress {
                    debug!("Found in-progress game '{}' for user {}", id, user_id);
                    return Ok(Some(record));
                }
            }
        }

        Ok(None)
    }

    async fn update_game_result(&self, game_id: &str, result: &GameResult) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let mut record = Self::read_record(&mut conn, game_id)
            .await?
            .ok_or_else(|| Error::NotFound(game_id.to_string()))?;

        record.apply_result(result);
        let json = serde_json::to_string(&record)?;
        conn.set::<_, _, ()>(game_key(game_id), &json).await?;

        info!(
            "Updated game '{}' to {} ({} by {})",
            game_id, result.status, result.outcome, result.method
        );
        Ok(())
    }

    async fn insert_move(&self, payload: &MovePayload) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let key = moves_key(&payload.game_id);
        let json = serde_json::to_string(payload)?;
        let number = payload.move_number;

        let _: () = redis::pipe()
            .atomic()
            .zrembyscore(&key, number, number)
            .ignore()
            .zadd(&key, &json, number)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(
            "Stored move {} of game '{}'",
            payload.move_number, payload.game_id
        );
        Ok(())
    }

    async fn list_moves(&self, game_id: &str) -> Result<Vec<MovePayload>> {
        let mut conn = self.get_connection().await?;
        let raw: Vec<String> = conn.zrange(moves_key(game_id), 0, -1).await?;

        raw.iter()
            .map(|j| serde_json::from_str(j).map_err(Error::from))
            .collect()
    }
}
