//! Outbound handle for one live client connection.
//!
//! The transport (WebSocket task in the gateway) owns the receiving end of
//! the channel and writes whatever arrives to the socket.

use crate::protocol::ServerMessage;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::warn;
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Default buffer size for connection channels.
pub const CONNECTION_CHANNEL_BUFFER_SIZE: usize = 256;

/// Frame handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Close the socket; nothing follows.
    Close,
}

/// State for a single connected client.
#[derive(Debug)]
pub struct Connection {
    /// Unique connection identifier.
    pub id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    /// Timestamp when the client connected (ms).
    pub connected_at: i64,
    /// Timestamp of the last inbound frame (ms).
    last_seen: AtomicI64,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Connection {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            tx,
            connected_at: now,
            last_seen: AtomicI64::new(now),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Create a connection with a bounded channel.
    pub fn channel() -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(CONNECTION_CHANNEL_BUFFER_SIZE);
        (Arc::new(Self::new(tx)), rx)
    }

    /// Send a message to this client.
    /// Returns false if the connection is closed or its buffer is full.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        match msg.to_json() {
            Ok(json) => self.send_text(json),
            Err(e) => {
                warn!("Failed to serialize message for {}: {}", self.id, e);
                false
            }
        }
    }

    /// Send pre-serialized JSON. Uses try_send: drops the frame if the buffer is full.
    pub fn send_text(&self, text: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.try_send(Outbound::Text(text)).is_ok()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.try_send(Outbound::Close);
        self.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn touch(&self) {
        self.last_seen
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }
}
