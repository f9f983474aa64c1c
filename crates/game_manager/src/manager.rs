//! Orchestrator: sessions, matchmaking, move dispatch and fan-out routing.
//!
//! Lock order is registry first, then a game. Nothing takes a game lock and
//! then the registry.

use crate::connection::{Connection, ConnectionId};
use crate::error::{GameError, Result};
use crate::fanout::{FanOut, MemoryFanOut, PayloadStream};
use crate::game::{Game, MoveOutcome};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::rules::Side;
use crate::session::{SessionRegistry, SessionSnapshot};
use futures::StreamExt;
use game_store::{
    GameId, GameResult, GameStore, MemoryGameStore, MemoryMoveQueue, MoveQueue, UserId,
};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default time a disconnected player has to come back.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// Configuration for the game manager.
#[derive(Debug, Clone)]
pub struct GameManagerConfig {
    /// Disconnect grace period before a match is abandoned.
    pub grace_period: Duration,
    /// Look up the store for an in-progress match on a user's first connection.
    pub replay_on_first_connect: bool,
}

impl Default for GameManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            replay_on_first_connect: true,
        }
    }
}

/// External collaborators the orchestrator talks to.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn GameStore>,
    pub queue: Arc<dyn MoveQueue>,
    pub fanout: Arc<dyn FanOut>,
}

impl Backends {
    pub fn new(
        store: Arc<dyn GameStore>,
        queue: Arc<dyn MoveQueue>,
        fanout: Arc<dyn FanOut>,
    ) -> Self {
        Self {
            store,
            queue,
            fanout,
        }
    }

    /// Single-process backends with no external services.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryGameStore::new()),
            Arc::new(MemoryMoveQueue::new()),
            Arc::new(MemoryFanOut::new()),
        )
    }
}

/// Shared orchestrator state, guarded by one lock.
#[derive(Default)]
struct Registry {
    sessions: SessionRegistry,
    games: HashMap<GameId, Arc<Game>>,
    /// Matchmaking slot.
    pending: Option<UserId>,
    /// Fan-out listener per match.
    subscriptions: HashMap<GameId, JoinHandle<()>>,
}

/// Result of installing a match rebuilt from the store.
enum Restore {
    Installed {
        game: Arc<Game>,
        recipients: Vec<Arc<Connection>>,
        /// Participants without a live connection, with their session episode.
        absent: Vec<(UserId, u64)>,
    },
    AlreadyEnded,
    /// This participant is already playing another live match.
    Conflict(UserId),
}

pub struct GameManager {
    backends: Backends,
    config: GameManagerConfig,
    registry: RwLock<Registry>,
}

impl GameManager {
    pub fn new(backends: Backends, config: GameManagerConfig) -> Self {
        Self {
            backends,
            config,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Pre-admission check.
    pub fn can_user_connect(&self, user_id: &str) -> Result<()> {
        if user_id.trim().is_empty() {
            return Err(GameError::AuthenticationRequired);
        }
        Ok(())
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Register a new connection for `user_id`.
    ///
    /// An existing connection for the same user is closed. A user with a
    /// match (resident or persisted) gets the move history replayed.
    pub async fn connect(self: &Arc<Self>, user_id: &str, conn: Arc<Connection>) -> Result<()> {
        self.can_user_connect(user_id)?;

        let (game_id, first_contact) = {
            let mut reg = self.registry.write().await;
            let (session, created) = reg.sessions.get_or_create(user_id);
            if let Some(old) = session.attach(conn.clone()) {
                info!(
                    "User {} reconnected, closing superseded connection {}",
                    user_id, old.id
                );
                old.close();
            }
            let game_id = session.game_id.clone();
            gauge!("chess_connected_users").set(reg.sessions.live_count() as f64);
            (game_id, created)
        };

        counter!("chess_connections_total").increment(1);
        info!("User {} connected ({})", user_id, conn.id);

        match game_id {
            Some(game_id) => self.resume(user_id, &game_id, &conn).await,
            None if first_contact && self.config.replay_on_first_connect => {
                self.restore_from_store(user_id, &conn).await
            }
            None => {}
        }
        Ok(())
    }

    async fn resume(self: &Arc<Self>, user_id: &str, game_id: &str, conn: &Connection) {
        let resident = self.registry.read().await.games.get(game_id).cloned();
        if let Some(game) = resident {
            if game.is_active().await {
                game.handle_reconnect(user_id).await;
                conn.send(&ServerMessage::BoardReplay {
                    moves: game.history().await,
                });
                info!("User {} resumed game {}", user_id, game_id);
                return;
            }
        }
        self.restore_from_store(user_id, conn).await;
    }

    /// Rebuild the user's in-progress match from the store and replay it
    /// to both participants.
    async fn restore_from_store(self: &Arc<Self>, user_id: &str, conn: &Connection) {
        let record = match self.backends.store.find_active_game_for_user(user_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.drop_stale_affiliation(user_id).await;
                return;
            }
            Err(e) => {
                error!("Failed to look up active game for {}: {}", user_id, e);
                counter!("chess_store_failures_total", "op" => "find_active_game").increment(1);
                return;
            }
        };

        let restored = match self.backends.store.list_moves(&record.id).await {
            Ok(moves) => Game::restore(&record, &moves),
            Err(e) => {
                error!("Failed to load moves of game {}: {}", record.id, e);
                counter!("chess_store_failures_total", "op" => "list_moves").increment(1);
                Err(GameError::RestoreFailed {
                    game_id: record.id.clone(),
                })
            }
        };
        let restored = match restored {
            Ok(game) => Arc::new(game),
            Err(e) => {
                warn!("Could not restore game {} for {}: {}", record.id, user_id, e);
                conn.send(&ServerMessage::error(&e));
                self.drop_stale_affiliation(user_id).await;
                return;
            }
        };

        let installed = {
            let mut guard = self.registry.write().await;
            let reg = &mut *guard;

            let game = match reg.games.get(&restored.id).cloned() {
                Some(existing) if existing.is_active().await => Some(existing),
                // Ended here but the store missed the result; trust memory.
                Some(_) => None,
                None => Some(restored),
            };
            match game {
                None => Restore::AlreadyEnded,
                Some(game) => match Self::conflicting_player(reg, &game).await {
                    Some(player) => Restore::Conflict(player),
                    None => Self::install_restored(reg, game),
                },
            }
        };

        let (game, recipients, absent) = match installed {
            Restore::Installed {
                game,
                recipients,
                absent,
            } => (game, recipients, absent),
            Restore::AlreadyEnded => {
                debug!("Game {} already ended locally, not restoring", record.id);
                self.drop_stale_affiliation(user_id).await;
                return;
            }
            Restore::Conflict(player) => {
                warn!(
                    "Not restoring game {} for {}: {} is playing another game",
                    record.id, user_id, player
                );
                counter!("chess_restore_conflicts_total").increment(1);
                conn.send(&ServerMessage::error(&GameError::RestoreFailed {
                    game_id: record.id.clone(),
                }));
                self.drop_stale_affiliation(user_id).await;
                return;
            }
        };

        self.open_subscription(&game).await;

        game.handle_reconnect(user_id).await;
        for (player, episode) in absent {
            if player == user_id || !game.handle_disconnect(&player).await {
                continue;
            }
            if self.registry.read().await.sessions.is_live(&player) {
                game.handle_reconnect(&player).await;
            } else {
                info!(
                    "{} is not connected, {:?} to rejoin restored game {}",
                    player, self.config.grace_period, game.id
                );
                self.arm_grace_timer(game.id.clone(), player, episode);
            }
        }

        let replay = ServerMessage::BoardReplay {
            moves: game.history().await,
        };
        for conn in &recipients {
            conn.send(&replay);
        }
        info!(
            "Restored game {} for {} ({} moves)",
            game.id,
            user_id,
            game.snapshot().await.move_number
        );
    }

    /// A participant of `game` already affiliated with a different live match.
    async fn conflicting_player(reg: &Registry, game: &Game) -> Option<UserId> {
        for player in game.players() {
            let Some(other) = reg.sessions.game_of(player) else {
                continue;
            };
            if other == game.id {
                continue;
            }
            if let Some(live) = reg.games.get(&other) {
                if live.is_active().await {
                    return Some(player.to_string());
                }
            }
        }
        None
    }

    /// Register a restored match and affiliate both participants with it.
    /// Participants without a session get a disconnected placeholder.
    fn install_restored(reg: &mut Registry, game: Arc<Game>) -> Restore {
        if !reg.games.contains_key(&game.id) {
            reg.games.insert(game.id.clone(), game.clone());
            gauge!("chess_active_games").increment(1.0);
        }

        let mut previous = Vec::new();
        for player in game.players() {
            if let Some(old) = reg.sessions.game_of(player) {
                if old != game.id {
                    previous.push(old);
                }
            }
            reg.sessions.assign_game(player, &game.id);
        }
        for old in previous {
            Self::release_game(reg, &old);
        }

        let recipients = game
            .players()
            .into_iter()
            .filter_map(|p| reg.sessions.connection_of(p))
            .collect();
        let absent = game
            .players()
            .into_iter()
            .filter(|p| !reg.sessions.is_live(p))
            .filter_map(|p| reg.sessions.get(p).map(|s| (p.to_string(), s.episode)))
            .collect();
        Restore::Installed {
            game,
            recipients,
            absent,
        }
    }

    /// Forget a match affiliation that no longer points at a live match.
    async fn drop_stale_affiliation(&self, user_id: &str) {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        let Some(game_id) = reg.sessions.game_of(user_id) else {
            return;
        };
        let active = match reg.games.get(&game_id).cloned() {
            Some(game) => game.is_active().await,
            None => false,
        };
        if !active {
            reg.sessions.clear_game(user_id, &game_id);
            Self::release_game(reg, &game_id);
            debug!("Cleared stale game {} from {}", game_id, user_id);
        }
    }

    /// Mark a connection gone.
    ///
    /// A superseded connection is ignored. A player in an active match gets
    /// a grace period before the match is abandoned.
    pub async fn disconnect(self: &Arc<Self>, user_id: &str, connection_id: ConnectionId) {
        let (game, episode) = {
            let mut reg = self.registry.write().await;

            let Some(session) = reg.sessions.get_mut(user_id) else {
                return;
            };
            if !session.detach(connection_id) {
                debug!(
                    "Ignoring disconnect of superseded connection {} for {}",
                    connection_id, user_id
                );
                return;
            }
            let episode = session.episode;
            let game_id = session.game_id.clone();

            gauge!("chess_connected_users").set(reg.sessions.live_count() as f64);
            info!("User {} disconnected", user_id);

            let game = game_id.and_then(|id| reg.games.get(&id).cloned());
            (game, episode)
        };

        let Some(game) = game else {
            return;
        };
        if game.handle_disconnect(user_id).await {
            // A reconnect may have landed while the registry was unlocked.
            if self.registry.read().await.sessions.is_live(user_id) {
                game.handle_reconnect(user_id).await;
                return;
            }
            info!(
                "User {} has {:?} to rejoin game {}",
                user_id, self.config.grace_period, game.id
            );
            self.arm_grace_timer(game.id.clone(), user_id.to_string(), episode);
        }
    }

    fn arm_grace_timer(self: &Arc<Self>, game_id: GameId, user_id: UserId, episode: u64) {
        let manager = Arc::downgrade(self);
        let deadline = tokio::time::Instant::now() + self.config.grace_period;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire_grace(&game_id, &user_id, episode).await;
            }
        });
    }

    /// Grace timer callback. Re-validates everything before acting.
    async fn expire_grace(&self, game_id: &str, user_id: &str, episode: u64) {
        let (result, recipients) = {
            let mut guard = self.registry.write().await;
            let reg = &mut *guard;

            let still_away = reg
                .sessions
                .get(user_id)
                .map(|s| !s.connected && s.episode == episode)
                .unwrap_or(false);
            if !still_away {
                debug!("Grace timer for {} in game {} is stale", user_id, game_id);
                return;
            }
            let Some(game) = reg.games.get(game_id).cloned() else {
                return;
            };
            let Some(result) = game.abandon().await else {
                debug!("Game {} ended before the grace period ran out", game_id);
                return;
            };

            let recipients: Vec<Arc<Connection>> = game
                .players()
                .iter()
                .filter_map(|p| reg.sessions.connection_of(p))
                .collect();
            for player in game.players() {
                reg.sessions.clear_game(player, game_id);
            }
            Self::close_subscription(reg, game_id);
            Self::release_game(reg, game_id);
            (result, recipients)
        };

        warn!("Game {} abandoned: {} did not reconnect", game_id, user_id);
        counter!("chess_games_finished_total", "status" => result.status.as_str()).increment(1);
        gauge!("chess_active_games").decrement(1.0);

        if let Err(e) = self.backends.store.update_game_result(game_id, &result).await {
            error!("Failed to persist abandonment of game {}: {}", game_id, e);
            counter!("chess_store_failures_total", "op" => "update_game_result").increment(1);
        }

        let over = ServerMessage::game_over(&result);
        for conn in &recipients {
            conn.send(&over);
        }
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    /// Handle one inbound frame. Any error is reported back on `conn`.
    pub async fn handle_message(self: &Arc<Self>, user_id: &str, conn: &Connection, text: &str) {
        conn.touch();

        let result = match ClientMessage::parse(text) {
            Ok(ClientMessage::InitGame) => self.init_game(user_id).await,
            Ok(ClientMessage::Move { notation }) => self.handle_move(user_id, &notation).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if e.is_policy() {
                debug!("Rejected message from {}: {}", user_id, e);
            } else {
                error!("Failed to handle message from {}: {}", user_id, e);
            }
            conn.send(&ServerMessage::error(&e));
        }
    }

    /// Matchmaking. The first waiter plays white.
    pub async fn init_game(self: &Arc<Self>, user_id: &str) -> Result<()> {
        let mut guard = self.registry.write().await;
        let reg = &mut *guard;

        let conn = reg
            .sessions
            .connection_of(user_id)
            .ok_or_else(|| GameError::Internal(format!("no live session for {}", user_id)))?;

        if let Some(game_id) = reg.sessions.game_of(user_id) {
            match reg.games.get(&game_id).cloned() {
                Some(game) if game.is_active().await => return Err(GameError::AlreadyInGame),
                _ => {
                    reg.sessions.clear_game(user_id, &game_id);
                    Self::release_game(reg, &game_id);
                }
            }
        }

        if reg.pending.as_deref() == Some(user_id) {
            return Err(GameError::AlreadyWaiting);
        }

        if let Some(waiting) = reg.pending.clone() {
            let stale =
                !reg.sessions.is_live(&waiting) || reg.sessions.game_of(&waiting).is_some();
            if stale {
                info!("Clearing stale waiting user {}", waiting);
                reg.pending = None;
            }
        }

        let Some(waiting) = reg.pending.take() else {
            reg.pending = Some(user_id.to_string());
            conn.send(&ServerMessage::waiting());
            info!("Player {} waiting for opponent", user_id);
            return Ok(());
        };
        if waiting == user_id {
            reg.pending = Some(waiting);
            return Err(GameError::SelfPlay);
        }

        let game = Arc::new(Game::new(waiting.clone(), user_id));
        reg.games.insert(game.id.clone(), game.clone());
        reg.sessions.assign_game(&waiting, &game.id);
        reg.sessions.assign_game(user_id, &game.id);
        let white_conn = reg.sessions.connection_of(&waiting);
        drop(guard);

        // Before game_start goes out, so no move can be published unheard.
        self.open_subscription(&game).await;

        if let Err(e) = self.backends.store.create_game(&game.record()).await {
            error!("Failed to persist game {}: {}", game.id, e);
            counter!("chess_store_failures_total", "op" => "create_game").increment(1);
        }

        counter!("chess_games_started_total").increment(1);
        gauge!("chess_active_games").increment(1.0);
        info!(
            "Game started: {} (white: {}, black: {})",
            game.id, game.white_user_id, game.black_user_id
        );

        if let Some(white) = white_conn {
            white.send(&ServerMessage::GameStart {
                color: Side::White,
                game_id: game.id.clone(),
            });
        }
        conn.send(&ServerMessage::GameStart {
            color: Side::Black,
            game_id: game.id.clone(),
        });
        Ok(())
    }

    /// Dispatch a move to the user's current match.
    pub async fn handle_move(&self, user_id: &str, notation: &str) -> Result<()> {
        let game = {
            let reg = self.registry.read().await;
            reg.sessions
                .game_of(user_id)
                .and_then(|id| reg.games.get(&id).cloned())
                .ok_or(GameError::NotInGame)?
        };

        match game.apply_move(user_id, notation, &self.backends).await {
            Ok(MoveOutcome::Accepted { move_number }) => {
                debug!("Game {}: move {} by {}", game.id, move_number, user_id);
                Ok(())
            }
            Ok(MoveOutcome::Finished { notation, result }) => {
                self.finish_game(&game, &notation, &result).await;
                Ok(())
            }
            Err(e) => {
                counter!("chess_moves_rejected_total").increment(1);
                Err(e)
            }
        }
    }

    /// Deliver the final move and result directly; the topic is torn down.
    async fn finish_game(&self, game: &Game, notation: &str, result: &GameResult) {
        let recipients: Vec<Arc<Connection>> = {
            let mut guard = self.registry.write().await;
            Self::close_subscription(&mut guard, &game.id);
            game.players()
                .iter()
                .filter_map(|p| guard.sessions.connection_of(p))
                .collect()
        };

        counter!("chess_games_finished_total", "status" => result.status.as_str()).increment(1);
        gauge!("chess_active_games").decrement(1.0);

        let last_move = ServerMessage::Move {
            notation: notation.to_string(),
        };
        let over = ServerMessage::game_over(result);
        for conn in &recipients {
            conn.send(&last_move);
            conn.send(&over);
        }
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    /// Subscribe to a match's topic. The broker round trip runs without the
    /// registry lock held.
    async fn open_subscription(self: &Arc<Self>, game: &Game) {
        if self.registry.read().await.subscriptions.contains_key(&game.id) {
            return;
        }

        let topic = game.topic();
        let stream = match self.backends.fanout.subscribe(&topic).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to {}: {}", topic, e);
                counter!("chess_fanout_subscribe_failures_total").increment(1);
                return;
            }
        };

        let active = game.is_active().await;
        let mut reg = self.registry.write().await;
        if reg.subscriptions.contains_key(&game.id) || !reg.games.contains_key(&game.id) || !active
        {
            debug!("Discarding redundant subscription to {}", topic);
            return;
        }
        let handle = tokio::spawn(Self::run_listener(
            Arc::downgrade(self),
            game.id.clone(),
            stream,
        ));
        reg.subscriptions.insert(game.id.clone(), handle);
        info!("Subscribed to game channel: {}", topic);
    }

    fn close_subscription(reg: &mut Registry, game_id: &str) {
        if let Some(handle) = reg.subscriptions.remove(game_id) {
            handle.abort();
            info!("Unsubscribed from game channel for {}", game_id);
        }
    }

    /// Drop a match nobody references any more.
    fn release_game(reg: &mut Registry, game_id: &str) {
        if reg.sessions.references_game(game_id) {
            return;
        }
        if reg.games.remove(game_id).is_some() {
            debug!("Released game {}", game_id);
        }
        Self::close_subscription(reg, game_id);
    }

    async fn run_listener(manager: Weak<Self>, game_id: GameId, mut stream: PayloadStream) {
        while let Some(payload) = stream.next().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if let Err(e) = manager.route_published(&game_id, &payload).await {
                warn!("Dropping fan-out message for game {}: {}", game_id, e);
                counter!("chess_fanout_routing_errors_total").increment(1);
            }
        }
        debug!("Fan-out listener for game {} stopped", game_id);
    }

    /// Deliver a published move to both participants' current connections.
    async fn route_published(&self, game_id: &str, payload: &[u8]) -> Result<()> {
        let msg: ServerMessage = serde_json::from_slice(payload)?;
        if !matches!(msg, ServerMessage::Move { .. }) {
            return Err(GameError::Internal(format!(
                "unexpected fan-out message on game {}",
                game_id
            )));
        }
        let text = msg.to_json()?;

        let reg = self.registry.read().await;
        let Some(game) = reg.games.get(game_id) else {
            debug!("Game {} is gone, skipping fan-out delivery", game_id);
            return Ok(());
        };
        for player in game.players() {
            match reg.sessions.connection_of(player) {
                Some(conn) => {
                    if !conn.send_text(text.clone()) {
                        debug!("Could not deliver move to {}", player);
                    }
                }
                None => debug!("{} is offline, skipping delivery", player),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Number of matches still in progress.
    pub async fn active_games_count(&self) -> usize {
        let games: Vec<Arc<Game>> = self.registry.read().await.games.values().cloned().collect();
        let mut active = 0;
        for game in games {
            if game.is_active().await {
                active += 1;
            }
        }
        active
    }

    /// Number of known sessions, connected or not.
    pub async fn session_count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }

    /// Number of sessions with a live connection.
    pub async fn connected_count(&self) -> usize {
        self.registry.read().await.sessions.live_count()
    }

    pub async fn session(&self, user_id: &str) -> Option<SessionSnapshot> {
        self.registry
            .read()
            .await
            .sessions
            .get(user_id)
            .map(|s| s.snapshot())
    }

    pub async fn game(&self, game_id: &str) -> Option<Arc<Game>> {
        self.registry.read().await.games.get(game_id).cloned()
    }

    /// User holding the matchmaking slot.
    pub async fn waiting_user(&self) -> Option<UserId> {
        self.registry.read().await.pending.clone()
    }

    pub async fn subscription_count(&self) -> usize {
        self.registry.read().await.subscriptions.len()
    }

    /// Stop every fan-out listener, close every connection and flush
    /// pending publishes.
    pub async fn shutdown(&self) {
        {
            let mut reg = self.registry.write().await;
            for (game_id, handle) in reg.subscriptions.drain() {
                handle.abort();
                debug!("Stopped fan-out listener for game {}", game_id);
            }
            for conn in reg.sessions.connections() {
                conn.close();
            }
        }
        if let Err(e) = self.backends.fanout.flush().await {
            warn!("Failed to flush fan-out on shutdown: {}", e);
        }
        info!("GameManager stopped");
    }
}
