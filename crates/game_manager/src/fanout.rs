//! Per-match fan-out of accepted moves across orchestrator instances.
//!
//! Delivery is best-effort: a publish with no live subscriber is dropped,
//! matching NATS Core semantics.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use nats_client::NatsClient;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

/// Stream of raw payloads published on one topic.
/// Dropping it unsubscribes.
pub type PayloadStream = BoxStream<'static, Bytes>;

/// Topic name for a match.
pub fn game_topic(game_id: &str) -> String {
    nats_client::game_subject(game_id)
}

#[async_trait]
pub trait FanOut: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream>;

    /// Push out anything buffered. No-op for in-process fan-out.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Fan-out over NATS Core subjects.
#[derive(Clone)]
pub struct NatsFanOut {
    client: Arc<NatsClient>,
}

impl NatsFanOut {
    pub fn new(client: Arc<NatsClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FanOut for NatsFanOut {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream> {
        let subscriber = self.client.subscribe(topic).await?;
        Ok(subscriber.map(|msg| msg.payload).boxed())
    }

    async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}

/// Default per-topic buffer for [`MemoryFanOut`].
pub const MEMORY_TOPIC_CAPACITY: usize = 256;

type Topics = Arc<DashMap<String, broadcast::Sender<Bytes>>>;

/// In-process fan-out over tokio broadcast channels.
///
/// A topic exists only while it has subscribers.
pub struct MemoryFanOut {
    topics: Topics,
    capacity: usize,
}

impl MemoryFanOut {
    pub fn new() -> Self {
        Self::with_capacity(MEMORY_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for MemoryFanOut {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanOut for MemoryFanOut {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let delivered = match self.topics.get(topic) {
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                debug!("Unknown topic {}, dropping payload", topic);
                return Ok(());
            }
        };
        if !delivered {
            debug!("No subscribers on {}, dropping payload", topic);
            self.topics
                .remove_if(topic, |_, tx| tx.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<PayloadStream> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let name = topic.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let payload = match item {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("Subscriber on {} lagged: {}", name, e);
                    None
                }
            };
            futures::future::ready(payload)
        });
        Ok(TopicStream {
            inner: Some(stream.boxed()),
            topic: topic.to_string(),
            topics: self.topics.clone(),
        }
        .boxed())
    }
}

/// Subscription on a [`MemoryFanOut`] topic. The last one dropped removes
/// the topic.
struct TopicStream {
    inner: Option<PayloadStream>,
    topic: String,
    topics: Topics,
}

impl Stream for TopicStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        match self.inner.as_mut() {
            Some(inner) => inner.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for TopicStream {
    fn drop(&mut self) {
        // Release the receiver first so the count below excludes it
        drop(self.inner.take());
        if self
            .topics
            .remove_if(&self.topic, |_, tx| tx.receiver_count() == 0)
            .is_some()
        {
            debug!("Removed idle topic {}", self.topic);
        }
    }
}
