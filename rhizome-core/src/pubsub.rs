//! Pub/sub seam
//!
//! Topic fan-out is an external collaborator; the core only publishes record
//! updates and subscribes to record topics. `MemoryPubSub` is the in-process
//! loopback used offline and in tests.

use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("Publish failed on topic {0}")]
    Publish(String),

    #[error("Subscribe failed on topic {0}")]
    Subscribe(String),
}

#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub from: Option<PeerId>,
}

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError>;

    /// Subscribe to a topic; messages arrive on the returned channel until
    /// the receiver is dropped.
    async fn subscribe(&self, topic: &str)
        -> Result<mpsc::UnboundedReceiver<PubSubMessage>, PubSubError>;
}

/// Process-local pub/sub: every publish is fanned out to the live
/// subscribers of that topic, closed subscribers are pruned on the way.
pub struct MemoryPubSub {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<PubSubMessage>>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PubSubError> {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| {
                tx.send(PubSubMessage {
                    topic: topic.to_string(),
                    data: data.clone(),
                    from: None,
                })
                .is_ok()
            });
            trace!(topic, subscribers = subscribers.len(), "published");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<PubSubMessage>, PubSubError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = MemoryPubSub::new();
        let mut rx = bus.subscribe("records").await.unwrap();

        bus.publish("records", b"update".to_vec()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "records");
        assert_eq!(msg.data, b"update");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = MemoryPubSub::new();
        bus.publish("empty", b"nobody home".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_fan_out() {
        let bus = MemoryPubSub::new();
        let mut rx1 = bus.subscribe("t").await.unwrap();
        let mut rx2 = bus.subscribe("t").await.unwrap();

        bus.publish("t", b"both".to_vec()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().data, b"both");
        assert_eq!(rx2.recv().await.unwrap().data, b"both");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_pruned() {
        let bus = MemoryPubSub::new();
        let rx = bus.subscribe("t").await.unwrap();
        drop(rx);

        bus.publish("t", b"gone".to_vec()).await.unwrap();
        assert!(bus.topics.read().await.get("t").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = MemoryPubSub::new();
        let mut rx = bus.subscribe("a").await.unwrap();

        bus.publish("b", b"other channel".to_vec()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
