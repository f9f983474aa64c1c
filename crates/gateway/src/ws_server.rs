//! WebSocket server handler using Axum.

use crate::error::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use game_manager::{Connection, GameError, GameManager, Outbound, ServerMessage};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Header carrying the authenticated user id, set by the upstream auth proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

/// How long a finished socket gets to flush its close frame.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared application state.
pub struct AppState {
    pub manager: Arc<GameManager>,
    pub ping_interval: Duration,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_games: usize,
    pub sessions: usize,
    /// Sessions with a live connection.
    pub connected: usize,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_games: state.manager.active_games_count().await,
        sessions: state.manager.session_count().await,
        connected: state.manager.connected_count().await,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
}

/// Header first, then the `user_id` query parameter.
fn resolve_user_id(headers: &HeaderMap, params: &ConnectParams) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| params.user_id.clone())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// WebSocket upgrade handler. Rejected admissions never upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse> {
    let user_id = resolve_user_id(&headers, &params);
    if let Err(e) = state.manager.can_user_connect(&user_id) {
        counter!("gateway_admissions_rejected_total").increment(1);
        warn!("Rejected WebSocket upgrade: {}", e);
        return Err(e.into());
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    // Split the socket into sender and receiver
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (conn, mut outbound_rx) = Connection::channel();
    // Ping/pong frames bypass the game message channel
    let (control_tx, mut control_rx) = mpsc::channel::<Message>(8);

    // Spawn task to forward messages from channels to WebSocket
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    Some(Outbound::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(frame) = control_rx.recv() => {
                    if ws_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    if let Err(e) = state.manager.connect(&user_id, conn.clone()).await {
        warn!("Failed to register connection for {}: {}", user_id, e);
        conn.send(&ServerMessage::error(&e));
        conn.close();
        let _ = tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task).await;
        send_task.abort();
        return;
    }

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").increment(1.0);
    info!("Client {} connected as {}", conn.id, user_id);

    // Ping interval for keepalive
    let mut ping_interval = interval(state.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.reset();

    // Handle incoming messages
    loop {
        tokio::select! {
            biased;

            // Handle incoming WebSocket messages
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.manager.handle_message(&user_id, &conn, text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => state.manager.handle_message(&user_id, &conn, text).await,
                        Err(_) => {
                            conn.send(&ServerMessage::error(&GameError::InvalidMessage));
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        conn.touch();
                        let _ = control_tx.try_send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        conn.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        // Connection closed
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", conn.id, e);
                        break;
                    }
                }
            }

            // Superseded by a newer connection of the same user
            _ = conn.closed() => {
                debug!("Connection {} of {} was superseded", conn.id, user_id);
                break;
            }

            // Send ping periodically
            _ = ping_interval.tick() => {
                let ping = Message::Ping(Vec::<u8>::new().into());
                if let Err(mpsc::error::TrySendError::Closed(_)) = control_tx.try_send(ping) {
                    break;
                }
            }
        }
    }

    // Cleanup
    state.manager.disconnect(&user_id, conn.id).await;
    conn.close();
    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").decrement(1.0);

    info!("Client {} ({}) disconnected", conn.id, user_id);
}
