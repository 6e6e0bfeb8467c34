//! Control message publisher
//!
//! Drains the coordinator's outbound queue onto the output channel.

use crate::coordinator::ControlMessage;
use crate::error::CoordinatorError;
use crate::store::StoreClient;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ControlPublisher {
    store: Arc<dyn StoreClient>,
    channel: String,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl ControlPublisher {
    pub fn new(store: Arc<dyn StoreClient>, channel: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store,
            channel: channel.into(),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        })
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Publish a single control message
    pub async fn publish(&self, message: &ControlMessage) -> Result<(), CoordinatorError> {
        let payload = serde_json::to_string(message).map_err(|source| {
            CoordinatorError::SerializationFailed {
                what: "control message",
                source,
            }
        })?;

        match self.store.publish(&self.channel, &payload).await {
            Ok(()) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %self.channel, message = message.type_label(), "Control message published");
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = %self.channel,
                    message = message.type_label(),
                    error = %e,
                    "Failed to publish control message"
                );
                Err(e)
            }
        }
    }

    /// Publish queued messages in order until every sender is dropped
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ControlMessage>) {
        info!(channel = %self.channel, "Control publisher started");
        while let Some(message) = rx.recv().await {
            // Failures are logged; the next resync reconciles.
            let _ = self.publish(&message).await;
        }
        info!(
            published = self.messages_published(),
            failures = self.publish_failures(),
            "Control publisher stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ShardId;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_run_publishes_in_order() {
        let store = Arc::new(MemoryStore::new());
        let publisher = ControlPublisher::new(store.clone(), "out");
        let (tx, rx) = mpsc::unbounded_channel();

        tx.send(ControlMessage::RequestSyncAll).unwrap();
        tx.send(ControlMessage::CheckAlive { id: ShardId::from(2) }).unwrap();
        drop(tx);
        Arc::clone(&publisher).run(rx).await;

        assert_eq!(
            store.published_on("out").await,
            vec![
                r#"{"type":"requestSyncAll"}"#.to_string(),
                r#"{"type":"checkAlive","id":2}"#.to_string(),
            ]
        );
        assert_eq!(publisher.messages_published(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let store = Arc::new(MemoryStore::new());
        let publisher = ControlPublisher::new(store.clone(), "out");

        store.set_unavailable(true);
        assert!(publisher.publish(&ControlMessage::CheckAliveAll).await.is_err());

        assert_eq!(publisher.publish_failures(), 1);
        assert_eq!(publisher.messages_published(), 0);
    }
}
