//! Per-user sessions.
//!
//! A session outlives its connections: it keeps the user's match
//! affiliation across reconnects and remembers when the user dropped.

use crate::connection::{Connection, ConnectionId};
use chrono::{DateTime, Utc};
use game_store::{GameId, UserId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct PlayerSession {
    pub user_id: UserId,
    /// Current connection; `None` while disconnected.
    connection: Option<Arc<Connection>>,
    pub game_id: Option<GameId>,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    /// Set on disconnect, cleared on reconnect.
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Bumped on every disconnect; a grace timer only acts on its own episode.
    pub episode: u64,
}

impl PlayerSession {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            connection: None,
            game_id: None,
            connected: false,
            last_seen: Utc::now(),
            disconnected_at: None,
            episode: 0,
        }
    }

    /// Make `conn` the current connection. Returns the superseded one.
    pub fn attach(&mut self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.connected = true;
        self.last_seen = Utc::now();
        self.disconnected_at = None;
        let new_id = conn.id;
        self.connection.replace(conn).filter(|old| old.id != new_id)
    }

    /// Mark the session disconnected if `conn_id` is still current.
    ///
    /// Returns false for a stale connection (already superseded).
    pub fn detach(&mut self, conn_id: ConnectionId) -> bool {
        match &self.connection {
            Some(current) if current.id == conn_id => {
                let now = Utc::now();
                self.connection = None;
                self.connected = false;
                self.last_seen = now;
                self.disconnected_at = Some(now);
                self.episode += 1;
                true
            }
            _ => false,
        }
    }

    /// Connected with a live transport.
    pub fn is_live(&self) -> bool {
        self.connected && self.connection.is_some()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.clone()
    }

    /// Latest activity: the live connection's last inbound frame, or the
    /// session's own timestamp when that is newer.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.connection
            .as_ref()
            .and_then(|c| DateTime::from_timestamp_millis(c.last_seen()))
            .filter(|seen| *seen > self.last_seen)
            .unwrap_or(self.last_seen)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            user_id: self.user_id.clone(),
            game_id: self.game_id.clone(),
            connected: self.connected,
            last_seen: self.last_activity(),
            disconnected_at: self.disconnected_at,
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub user_id: UserId,
    pub game_id: Option<GameId>,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// All known sessions, keyed by user id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<UserId, PlayerSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<&PlayerSession> {
        self.sessions.get(user_id)
    }

    pub fn get_mut(&mut self, user_id: &str) -> Option<&mut PlayerSession> {
        self.sessions.get_mut(user_id)
    }

    /// Returns the session and whether it was just created.
    pub fn get_or_create(&mut self, user_id: &str) -> (&mut PlayerSession, bool) {
        let created = !self.sessions.contains_key(user_id);
        let session = self
            .sessions
            .entry(user_id.to_string())
            .or_insert_with(|| PlayerSession::new(user_id));
        (session, created)
    }

    /// Current connection of a user, if connected.
    pub fn connection_of(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.sessions.get(user_id).and_then(|s| s.connection())
    }

    pub fn is_live(&self, user_id: &str) -> bool {
        self.sessions.get(user_id).map(|s| s.is_live()).unwrap_or(false)
    }

    pub fn game_of(&self, user_id: &str) -> Option<GameId> {
        self.sessions.get(user_id).and_then(|s| s.game_id.clone())
    }

    /// Affiliate a user with a match, creating a placeholder session if needed.
    pub fn assign_game(&mut self, user_id: &str, game_id: &str) {
        let (session, _) = self.get_or_create(user_id);
        session.game_id = Some(game_id.to_string());
    }

    /// Clear a user's affiliation, but only if it still points at `game_id`.
    pub fn clear_game(&mut self, user_id: &str, game_id: &str) -> bool {
        match self.sessions.get_mut(user_id) {
            Some(session) if session.game_id.as_deref() == Some(game_id) => {
                session.game_id = None;
                true
            }
            _ => false,
        }
    }

    /// Whether any session still references `game_id`.
    pub fn references_game(&self, game_id: &str) -> bool {
        self.sessions
            .values()
            .any(|s| s.game_id.as_deref() == Some(game_id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_live()).count()
    }

    /// Every live connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.sessions.values().filter_map(|s| s.connection()).collect()
    }
}
