//! In-process pub/sub hub for pushing status events to observers.
//!
//! Channels are keyed by resource type plus id (`batch:abc`, `library:react`).
//! Delivery is best-effort and at-most-once per connected subscriber: a
//! publish with no subscribers is a no-op, and a lagged subscriber simply
//! misses messages. Consumers treat events as freshness hints and re-read
//! authoritative status from the job store.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Topic-keyed broadcast hub. Thread-safe and cheap to clone.
///
/// Payloads are `serde_json::Value`; producers serialize their own types.
#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
    capacity: usize,
}

/// Build the channel key for a resource.
pub fn topic(resource_type: &str, resource_id: &str) -> String {
    format!("{resource_type}:{resource_id}")
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish an event for a resource. Fire-and-forget: no subscribers,
    /// no delivery, no error.
    pub async fn publish(&self, resource_type: &str, resource_id: &str, value: serde_json::Value) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&topic(resource_type, resource_id)) {
            // Send errors mean no active receivers
            let _ = tx.send(value);
        }
    }

    /// Subscribe to a resource's events, creating the channel on demand.
    pub async fn subscribe(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic(resource_type, resource_id))
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Drop channels nobody is listening to (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    #[cfg(test)]
    async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let hub = StreamHub::new();
        let mut rx = hub.subscribe("batch", "b1").await;

        let value = json!({"type": "job_completed", "job_id": 1});
        hub.publish("batch", "b1", value.clone()).await;

        assert_eq!(rx.recv().await.unwrap(), value);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = StreamHub::new();
        hub.publish("batch", "nobody", json!({"dropped": true})).await;
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn topics_are_scoped_per_resource() {
        let hub = StreamHub::new();
        let mut batch_rx = hub.subscribe("batch", "b1").await;
        let mut library_rx = hub.subscribe("library", "b1").await;

        hub.publish("batch", "b1", json!({"scope": "batch"})).await;

        assert_eq!(batch_rx.recv().await.unwrap(), json!({"scope": "batch"}));
        assert!(library_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cleanup_drops_abandoned_channels() {
        let hub = StreamHub::new();
        let rx = hub.subscribe("batch", "gone").await;
        assert_eq!(hub.channel_count().await, 1);

        drop(rx);
        hub.cleanup().await;
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let hub = StreamHub::new();
        let mut rx1 = hub.subscribe("batch", "b1").await;
        let mut rx2 = hub.subscribe("batch", "b1").await;

        hub.publish("batch", "b1", json!({"n": 1})).await;

        assert_eq!(rx1.recv().await.unwrap(), json!({"n": 1}));
        assert_eq!(rx2.recv().await.unwrap(), json!({"n": 1}));
    }
}
