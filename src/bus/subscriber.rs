//! Input channel subscriber
//!
//! Holds a dedicated Redis pub/sub connection on the input channel and feeds
//! every payload to the coordinator. The connection is re-established with
//! exponential backoff. Every successful subscription is followed by a
//! `requestSyncAll`, since shard events published while unsubscribed are lost.

use crate::coordinator::CoordinatorHandle;
use crate::error::CoordinatorError;
use crate::metrics;
use futures::StreamExt;
use redis::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

/// Timeout for establishing the pub/sub connection and subscribing
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Initial backoff delay for reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for reconnection
const MAX_BACKOFF_SECS: u64 = 30;

enum SubscriberExit {
    /// Connection was established and later dropped
    Disconnected,
    ConnectFailed(CoordinatorError),
}

pub struct InputSubscriber {
    client: Client,
    channel: String,
    coordinator: CoordinatorHandle,
    connected: AtomicBool,
    messages_received: AtomicU64,
}

impl InputSubscriber {
    /// Create a subscriber; nothing connects until [`InputSubscriber::run`]
    pub fn new(client: Client, channel: impl Into<String>, coordinator: CoordinatorHandle) -> Arc<Self> {
        Arc::new(Self {
            client,
            channel: channel.into(),
            coordinator,
            connected: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Subscribe and forward messages until shutdown, reconnecting as needed
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            let exit = tokio::select! {
                exit = self.run_subscription() => exit,
                _ = shutdown_rx.recv() => {
                    info!("Input subscriber received shutdown signal");
                    self.set_connected(false);
                    return;
                }
            };
            self.set_connected(false);

            match exit {
                SubscriberExit::Disconnected => {
                    error!(
                        channel = %self.channel,
                        "Input subscription lost, reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(
                        channel = %self.channel,
                        error = %e,
                        backoff_secs,
                        "Input subscriber failed to connect, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Input subscriber stopped during backoff");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn run_subscription(&self) -> SubscriberExit {
        let connect = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.client.get_async_pubsub(),
        )
        .await;
        let mut pubsub = match connect {
            Ok(Ok(pubsub)) => pubsub,
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(CoordinatorError::StoreConnectionFailed(Box::new(e)))
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(CoordinatorError::StoreTimeout {
                    operation: "pubsub_connect",
                })
            }
        };

        let subscribe = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(self.channel.as_str()),
        )
        .await;
        match subscribe {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return SubscriberExit::ConnectFailed(CoordinatorError::store("subscribe", &self.channel, e))
            }
            Err(_) => {
                return SubscriberExit::ConnectFailed(CoordinatorError::StoreTimeout {
                    operation: "subscribe",
                })
            }
        }

        info!(channel = %self.channel, "Input subscriber connected");
        self.set_connected(true);
        self.coordinator.request_sync_all();

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name();
            if channel != self.channel {
                error!(channel, "Message from unexpected channel; ignoring");
                continue;
            }

            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, channel, "Invalid payload");
                    metrics::record_rejected("invalid_payload");
                    continue;
                }
            };

            self.messages_received.fetch_add(1, Ordering::Relaxed);
            debug!(bytes = payload.len(), "Input message received");
            self.coordinator.submit(payload);
        }

        SubscriberExit::Disconnected
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        metrics::set_subscriber_connected(connected);
    }
}
