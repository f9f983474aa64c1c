//! NATS Core client used as the cross-instance fan-out broker.

use anyhow::Result;
use async_nats::{Client, Subscriber};
use tracing::{debug, info};

/// Subject prefix for per-match topics: game.{game_id}
pub const GAME_SUBJECT_PREFIX: &str = "game.";

/// Build the fan-out subject for a match.
///
/// NATS subjects are dot-separated, so dots inside the id are replaced.
pub fn game_subject(game_id: &str) -> String {
    format!("{}{}", GAME_SUBJECT_PREFIX, game_id.replace('.', "_"))
}

/// Wrapper around the NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", url);
        let client = async_nats::connect(url).await?;
        Ok(Self { client })
    }

    /// Subscribe to a subject using NATS Core (low-latency push).
    ///
    /// Dropping the returned subscriber unsubscribes.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        info!("Subscribing to subject: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Publish using NATS Core (fire-and-forget, lowest latency).
    pub async fn publish(&self, subject: &str, payload: bytes::Bytes) -> Result<()> {
        debug!("Publishing {} bytes to {}", payload.len(), subject);
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// Flush buffered publishes to the server.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}
