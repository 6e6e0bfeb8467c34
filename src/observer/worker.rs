//! Ordered, non-blocking dispatch of observer calls
//!
//! Shard mirrors submit lifecycle events through an [`ObserverHandle`]. A
//! single worker task applies them to the observer in submission order, so
//! the coordinator never waits on the store while the store still sees each
//! connection's events in the order the shard sent them.

use super::PresenceObserver;
use crate::ids::{ConnectionId, UserId};
use crate::metrics;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

#[derive(Debug)]
enum ObserverCall {
    Created {
        connection_id: ConnectionId,
    },
    FieldSet {
        connection_id: ConnectionId,
        name: Option<String>,
        value: Option<String>,
    },
    Identified {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Subscribed {
        connection_id: ConnectionId,
        user_id: Option<UserId>,
        stream: String,
    },
    Destroyed {
        connection_id: ConnectionId,
        user_id: Option<UserId>,
    },
    Flush(oneshot::Sender<()>),
}

/// Cloneable, fire-and-forget front of the observer worker
#[derive(Clone)]
pub struct ObserverHandle {
    tx: mpsc::UnboundedSender<ObserverCall>,
    observer: Arc<dyn PresenceObserver>,
}

impl ObserverHandle {
    /// Spawn the worker task. It runs until every handle is dropped.
    pub fn spawn(observer: Arc<dyn PresenceObserver>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(Arc::clone(&observer), rx));
        Self { tx, observer }
    }

    pub fn connection_created(&self, connection_id: ConnectionId) {
        self.submit(ObserverCall::Created { connection_id });
    }

    pub fn connection_field_set(
        &self,
        connection_id: ConnectionId,
        name: Option<String>,
        value: Option<String>,
    ) {
        self.submit(ObserverCall::FieldSet {
            connection_id,
            name,
            value,
        });
    }

    pub fn connection_identified(&self, connection_id: ConnectionId, user_id: UserId) {
        self.submit(ObserverCall::Identified {
            connection_id,
            user_id,
        });
    }

    pub fn connection_subscribed(
        &self,
        connection_id: ConnectionId,
        user_id: Option<UserId>,
        stream: String,
    ) {
        self.submit(ObserverCall::Subscribed {
            connection_id,
            user_id,
            stream,
        });
    }

    pub fn connection_destroyed(&self, connection_id: ConnectionId, user_id: Option<UserId>) {
        self.submit(ObserverCall::Destroyed {
            connection_id,
            user_id,
        });
    }

    /// Wait until every call submitted before this one has been applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.submit(ObserverCall::Flush(done_tx));
        let _ = done_rx.await;
    }

    pub fn total_guest_connections(&self) -> i64 {
        self.observer.total_guest_connections()
    }

    pub fn is_degraded(&self) -> bool {
        self.observer.is_degraded()
    }

    fn submit(&self, call: ObserverCall) {
        if let Err(e) = self.tx.send(call) {
            warn!(call = ?e.0, "Observer worker is gone; dropping presence update");
        }
    }
}

async fn run_worker(
    observer: Arc<dyn PresenceObserver>,
    mut rx: mpsc::UnboundedReceiver<ObserverCall>,
) {
    debug!("Observer worker started");

    while let Some(call) = rx.recv().await {
        let (operation, result) = match call {
            ObserverCall::Created { connection_id } => (
                "connection_created",
                observer.connection_created(&connection_id).await,
            ),
            ObserverCall::FieldSet {
                connection_id,
                name,
                value,
            } => (
                "connection_field_set",
                observer
                    .connection_field_set(&connection_id, name.as_deref(), value.as_deref())
                    .await,
            ),
            ObserverCall::Identified {
                connection_id,
                user_id,
            } => (
                "connection_identified",
                observer
                    .connection_identified(&connection_id, &user_id)
                    .await,
            ),
            ObserverCall::Subscribed {
                connection_id,
                user_id,
                stream,
            } => (
                "connection_subscribed",
                observer
                    .connection_subscribed(&connection_id, user_id.as_ref(), &stream)
                    .await,
            ),
            ObserverCall::Destroyed {
                connection_id,
                user_id,
            } => (
                "connection_destroyed",
                observer
                    .connection_destroyed(&connection_id, user_id.as_ref())
                    .await,
            ),
            ObserverCall::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        if let Err(e) = result {
            error!(operation, error = %e, "Presence store update failed");
            metrics::record_store_error(operation, e.error_type_label());
        }
    }

    debug!("Observer worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeysConfig;
    use crate::flags::RuntimeFlags;
    use crate::observer::StoreObserver;
    use crate::store::{KeyLayout, MemoryStore, StoreClient};

    #[tokio::test]
    async fn test_calls_apply_in_submission_order() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeyLayout::new(KeysConfig::default());
        let observer = StoreObserver::new(
            store.clone(),
            keys.clone(),
            "events".to_string(),
            Arc::new(RuntimeFlags::new()),
        );
        let handle = ObserverHandle::spawn(Arc::new(observer));

        let c1 = ConnectionId::new("c1");
        handle.connection_created(c1.clone());
        handle.connection_identified(c1.clone(), UserId::new("7"));
        handle.connection_subscribed(c1.clone(), Some(UserId::new("7")), "news".to_string());
        handle.connection_destroyed(c1, Some(UserId::new("7")));
        handle.flush().await;

        assert_eq!(store.key_count().await, 0);
        assert!(store.smembers(keys.connection_ids()).await.unwrap().is_empty());
        assert!(!handle.is_degraded());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_worker() {
        let store = Arc::new(MemoryStore::new());
        let keys = KeyLayout::default();
        let observer = StoreObserver::new(
            store.clone(),
            keys.clone(),
            "events".to_string(),
            Arc::new(RuntimeFlags::new()),
        );
        let handle = ObserverHandle::spawn(Arc::new(observer));

        store.set_unavailable(true);
        handle.connection_created(ConnectionId::new("lost"));
        handle.flush().await;

        store.set_unavailable(false);
        handle.connection_created(ConnectionId::new("kept"));
        handle.flush().await;

        assert_eq!(
            store.smembers(keys.connection_ids()).await.unwrap(),
            vec!["kept".to_string()]
        );
    }
}
