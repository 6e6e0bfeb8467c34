//! Store-backed presence observer

use super::notification::{PresenceNotification, StreamEdge};
use super::PresenceObserver;
use crate::error::CoordinatorError;
use crate::flags::{FlagSource, FULL_STREAM_UPDATE, STREAM_EVENTS};
use crate::ids::{ConnectionId, UserId};
use crate::metrics;
use crate::store::{KeyLayout, StoreClient, StoreResult};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Log and count a failed store step, returning its value on success.
///
/// Cleanup fan-out steps are independent; one failing never stops the rest.
fn logged<T>(operation: &'static str, result: StoreResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            error!(operation, error = %e, "Presence store operation failed");
            metrics::record_store_error(operation, e.error_type_label());
            None
        }
    }
}

/// Relational state store over a [`StoreClient`].
///
/// Global sets hold every connection, user and stream. Per connection the
/// store keeps its fields, its user and its streams; per user its
/// connections and joined streams; per stream its connections, joined users
/// and a `user-<id>` connection counter whose 0→1 and 1→0 transitions are
/// the join/leave edges.
pub struct StoreObserver {
    store: Arc<dyn StoreClient>,
    keys: KeyLayout,
    stream_events_channel: String,
    flags: Arc<dyn FlagSource>,
    guest_connections: AtomicI64,
}

impl StoreObserver {
    pub fn new(
        store: Arc<dyn StoreClient>,
        keys: KeyLayout,
        stream_events_channel: String,
        flags: Arc<dyn FlagSource>,
    ) -> Self {
        Self {
            store,
            keys,
            stream_events_channel,
            flags,
            guest_connections: AtomicI64::new(0),
        }
    }

    async fn clear_user_ids(&self) -> StoreResult<()> {
        let ids = self.store.smembers(self.keys.user_ids()).await?;
        for id in &ids {
            self.store.del(&self.keys.user_connections(id)).await?;
            self.store.del(&self.keys.user_streams(id)).await?;
        }
        self.store.del(self.keys.user_ids()).await
    }

    async fn clear_connection_ids(&self) -> StoreResult<()> {
        let ids = self.store.smembers(self.keys.connection_ids()).await?;
        for id in &ids {
            self.store.del(&self.keys.connection_streams(id)).await?;
            self.store.del(&self.keys.connection_user(id)).await?;
            self.store.del(&self.keys.connection_data(id)).await?;
        }
        self.store.del(self.keys.connection_ids()).await
    }

    async fn clear_streams(&self) -> StoreResult<()> {
        let streams = self.store.smembers(self.keys.streams()).await?;
        for stream in &streams {
            self.store.del(&self.keys.stream_connections(stream)).await?;
            self.store.del(&self.keys.stream_user_counters(stream)).await?;
            self.store.del(&self.keys.stream_users(stream)).await?;
        }
        self.store.del(self.keys.streams()).await
    }

    fn cache_guest_counter(&self, value: i64) {
        self.guest_connections.store(value, Ordering::Relaxed);
        metrics::set_guest_connections(value);
    }

    async fn publish(&self, notification: PresenceNotification) {
        let payload = match serde_json::to_string(&notification) {
            Ok(payload) => payload,
            Err(source) => {
                let e = CoordinatorError::SerializationFailed {
                    what: "presence notification",
                    source,
                };
                error!(error = %e, "Failed to encode presence notification");
                return;
            }
        };

        if logged(
            "publish",
            self.store
                .publish(&self.stream_events_channel, &payload)
                .await,
        )
        .is_some()
        {
            metrics::record_notification(notification.command_label());
        }
    }

    async fn send_full_update(&self) {
        if self.flags.is_enabled(FULL_STREAM_UPDATE) {
            self.publish(PresenceNotification::FullUpdate).await;
        }
    }

    async fn send_stream_event(&self, event: StreamEdge, user_id: &UserId, stream: &str) {
        if self.flags.is_enabled(STREAM_EVENTS) {
            self.publish(PresenceNotification::StreamEvent {
                event,
                user_id: user_id.to_string(),
                stream: stream.to_string(),
            })
            .await;
        }
    }

    async fn user_joined_stream(&self, user_id: &UserId, stream: &str) {
        if user_id.is_guest() {
            return;
        }
        info!(user_id = %user_id, stream, "User joined stream");

        logged(
            "sadd",
            self.store
                .sadd(&self.keys.stream_users(stream), user_id.as_str())
                .await,
        );
        logged(
            "sadd",
            self.store
                .sadd(&self.keys.user_streams(user_id.as_str()), stream)
                .await,
        );

        self.send_stream_event(StreamEdge::Joined, user_id, stream).await;
    }

    async fn user_left_stream(&self, user_id: &UserId, stream: &str) {
        if user_id.is_guest() {
            return;
        }
        info!(user_id = %user_id, stream, "User left stream");

        logged(
            "srem",
            self.store
                .srem(&self.keys.stream_users(stream), user_id.as_str())
                .await,
        );
        logged(
            "srem",
            self.store
                .srem(&self.keys.user_streams(user_id.as_str()), stream)
                .await,
        );

        self.send_stream_event(StreamEdge::Left, user_id, stream).await;
    }

    async fn stream_no_longer_used(&self, stream: &str) {
        debug!(stream, "Stream has no subscribers left");
        logged("srem", self.store.srem(self.keys.streams(), stream).await);
        logged(
            "del",
            self.store.del(&self.keys.stream_connections(stream)).await,
        );
        logged("del", self.store.del(&self.keys.stream_users(stream)).await);
    }

    async fn user_no_longer_connected(&self, user_id: &UserId) {
        debug!(user_id = %user_id, "User has no connections left");
        logged(
            "srem",
            self.store.srem(self.keys.user_ids(), user_id.as_str()).await,
        );
        logged(
            "del",
            self.store
                .del(&self.keys.user_connections(user_id.as_str()))
                .await,
        );
        logged(
            "del",
            self.store.del(&self.keys.user_streams(user_id.as_str())).await,
        );
    }

    /// Stream-side branch of a destroy: unlink the connection from every
    /// stream it was subscribed to, concurrently per stream.
    async fn detach_streams(&self, connection_id: &ConnectionId, user_id: Option<&UserId>) {
        let key = self.keys.connection_streams(connection_id.as_str());
        let Some(streams) = logged("smembers", self.store.smembers(&key).await) else {
            return;
        };
        if !streams.is_empty() {
            logged("del", self.store.del(&key).await);

            join_all(
                streams
                    .iter()
                    .map(|stream| self.detach_stream(connection_id, user_id, stream)),
            )
            .await;
        }

        self.send_full_update().await;
    }

    async fn detach_stream(
        &self,
        connection_id: &ConnectionId,
        user_id: Option<&UserId>,
        stream: &str,
    ) {
        let subscribers = self.keys.stream_connections(stream);
        logged(
            "srem",
            self.store.srem(&subscribers, connection_id.as_str()).await,
        );
        if let Some(remaining) = logged("smembers", self.store.smembers(&subscribers).await) {
            if remaining.is_empty() {
                self.stream_no_longer_used(stream).await;
            }
        }

        let Some(user_id) = user_id else {
            return;
        };
        let counters = self.keys.stream_user_counters(stream);
        let field = KeyLayout::user_counter_field(user_id.as_str());
        let Some(count) = logged("hincrby", self.store.hincr(&counters, &field, -1).await) else {
            return;
        };
        if count > 0 {
            return;
        }

        logged("hdel", self.store.hdel(&counters, &field).await);
        if logged("hlen", self.store.hlen(&counters).await) == Some(0) {
            logged("del", self.store.del(&counters).await);
        }

        if count == 0 {
            self.user_left_stream(user_id, stream).await;
        } else {
            warn!(
                user_id = %user_id,
                stream,
                count,
                "Stream connection counter went negative; destroy userId differs from subscribe userId"
            );
        }
    }

    /// User-side branch of a destroy: unlink the connection from the user it
    /// was identified as, dropping the user once no connections remain.
    async fn detach_user(&self, connection_id: &ConnectionId) {
        let key = self.keys.connection_user(connection_id.as_str());
        let Some(stored) = logged("get", self.store.get(&key).await).flatten() else {
            return;
        };
        logged("del", self.store.del(&key).await);

        if let Some(user_id) = UserId::from_stored(stored) {
            let connections = self.keys.user_connections(user_id.as_str());
            logged(
                "srem",
                self.store.srem(&connections, connection_id.as_str()).await,
            );
            if let Some(remaining) = logged("smembers", self.store.smembers(&connections).await) {
                if remaining.is_empty() {
                    self.user_no_longer_connected(&user_id).await;
                }
            }
        }

        self.send_full_update().await;
    }
}

#[async_trait]
impl PresenceObserver for StoreObserver {
    async fn reset(&self) -> StoreResult<()> {
        self.store.del(self.keys.guest_connections()).await?;
        self.store.set(self.keys.guest_connections(), "0").await?;
        self.cache_guest_counter(0);

        self.clear_user_ids().await.map_err(|e| {
            error!(set = self.keys.user_ids(), error = %e, "Error clearing user set");
            e
        })?;
        info!("Done clearing per user data");

        self.clear_connection_ids().await.map_err(|e| {
            error!(set = self.keys.connection_ids(), error = %e, "Error clearing connection set");
            e
        })?;
        info!("Done clearing per connection data");

        self.clear_streams().await.map_err(|e| {
            error!(set = self.keys.streams(), error = %e, "Error clearing stream set");
            e
        })?;
        info!("Done clearing per stream data");

        Ok(())
    }

    async fn connection_created(&self, connection_id: &ConnectionId) -> StoreResult<()> {
        self.store
            .sadd(self.keys.connection_ids(), connection_id.as_str())
            .await?;
        Ok(())
    }

    async fn connection_field_set(
        &self,
        connection_id: &ConnectionId,
        name: Option<&str>,
        value: Option<&str>,
    ) -> StoreResult<()> {
        let Some(name) = name else {
            error!(connection_id = %connection_id, "Connection field name is missing");
            return Ok(());
        };
        let Some(value) = value else {
            warn!(connection_id = %connection_id, field = name, "Connection field value is missing");
            return Ok(());
        };

        self.store
            .hset(&self.keys.connection_data(connection_id.as_str()), name, value)
            .await
    }

    async fn connection_identified(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
    ) -> StoreResult<()> {
        self.store
            .sadd(self.keys.user_ids(), user_id.as_str())
            .await?;
        self.store
            .set(
                &self.keys.connection_user(connection_id.as_str()),
                user_id.as_str(),
            )
            .await?;
        self.store
            .sadd(
                &self.keys.user_connections(user_id.as_str()),
                connection_id.as_str(),
            )
            .await?;

        if user_id.is_guest() {
            let count = self.store.incr(self.keys.guest_connections()).await?;
            self.cache_guest_counter(count);
        }

        self.send_full_update().await;
        Ok(())
    }

    async fn connection_subscribed(
        &self,
        connection_id: &ConnectionId,
        user_id: Option<&UserId>,
        stream: &str,
    ) -> StoreResult<()> {
        self.store.sadd(self.keys.streams(), stream).await?;
        self.store
            .sadd(&self.keys.stream_connections(stream), connection_id.as_str())
            .await?;
        let newly_subscribed = self
            .store
            .sadd(&self.keys.connection_streams(connection_id.as_str()), stream)
            .await?;

        // A repeated subscribe must not count twice; destroy decrements once per stream
        if let (true, Some(user_id)) = (newly_subscribed, user_id) {
            let count = self
                .store
                .hincr(
                    &self.keys.stream_user_counters(stream),
                    &KeyLayout::user_counter_field(user_id.as_str()),
                    1,
                )
                .await?;
            if count == 1 {
                self.user_joined_stream(user_id, stream).await;
            }
        }

        self.send_full_update().await;
        Ok(())
    }

    async fn connection_destroyed(
        &self,
        connection_id: &ConnectionId,
        user_id: Option<&UserId>,
    ) -> StoreResult<()> {
        logged(
            "srem",
            self.store
                .srem(self.keys.connection_ids(), connection_id.as_str())
                .await,
        );

        if user_id.is_some_and(UserId::is_guest) {
            if let Some(count) = logged("decr", self.store.decr(self.keys.guest_connections()).await)
            {
                self.cache_guest_counter(count);
            }
        }

        let data_key = self.keys.connection_data(connection_id.as_str());
        futures::join!(
            self.detach_streams(connection_id, user_id),
            self.detach_user(connection_id),
            async { logged("del", self.store.del(&data_key).await) },
        );

        Ok(())
    }

    fn total_guest_connections(&self) -> i64 {
        self.guest_connections.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::RuntimeFlags;
    use crate::store::MemoryStore;

    const EVENTS: &str = "stream-events";

    struct Fixture {
        store: Arc<MemoryStore>,
        keys: KeyLayout,
        observer: StoreObserver,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let flags = RuntimeFlags::new();
        flags.set(FULL_STREAM_UPDATE, false);
        flags.set(STREAM_EVENTS, true);
        let keys = KeyLayout::default();
        let observer = StoreObserver::new(
            store.clone(),
            keys.clone(),
            EVENTS.to_string(),
            Arc::new(flags),
        );
        Fixture {
            store,
            keys,
            observer,
        }
    }

    fn cid(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn uid(id: &str) -> UserId {
        UserId::new(id)
    }

    async fn stream_events(store: &MemoryStore) -> Vec<PresenceNotification> {
        store
            .published_on(EVENTS)
            .await
            .iter()
            .map(|m| serde_json::from_str(m).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_reset_wipes_every_family() {
        let f = fixture();
        let o = &f.observer;
        o.connection_created(&cid("c1")).await.unwrap();
        o.connection_field_set(&cid("c1"), Some("ip"), Some("10.0.0.1"))
            .await
            .unwrap();
        o.connection_identified(&cid("c1"), &uid("7")).await.unwrap();
        o.connection_subscribed(&cid("c1"), Some(&uid("7")), "news")
            .await
            .unwrap();
        o.connection_created(&cid("c2")).await.unwrap();
        o.connection_identified(&cid("c2"), &UserId::guest()).await.unwrap();
        assert_eq!(o.total_guest_connections(), 1);

        o.reset().await.unwrap();

        // Only the zeroed guest counter survives
        assert_eq!(f.store.key_count().await, 1);
        assert_eq!(
            f.store.get(f.keys.guest_connections()).await.unwrap(),
            Some("0".to_string())
        );
        assert_eq!(o.total_guest_connections(), 0);
    }

    #[tokio::test]
    async fn test_field_set_requires_name_and_value() {
        let f = fixture();
        let data = f.keys.connection_data("c1");

        f.observer
            .connection_field_set(&cid("c1"), None, Some("v"))
            .await
            .unwrap();
        f.observer
            .connection_field_set(&cid("c1"), Some("k"), None)
            .await
            .unwrap();
        assert!(!f.store.contains_key(&data).await);

        f.observer
            .connection_field_set(&cid("c1"), Some("k"), Some("v"))
            .await
            .unwrap();
        assert_eq!(f.store.hgetall(&data).await.unwrap()["k"], "v");
    }

    #[tokio::test]
    async fn test_join_fires_once_per_user_and_stream() {
        let f = fixture();
        let o = &f.observer;
        for c in ["c1", "c2", "c3"] {
            o.connection_created(&cid(c)).await.unwrap();
            o.connection_identified(&cid(c), &uid("7")).await.unwrap();
            o.connection_subscribed(&cid(c), Some(&uid("7")), "news")
                .await
                .unwrap();
        }

        let events = stream_events(&f.store).await;
        assert_eq!(
            events,
            vec![PresenceNotification::StreamEvent {
                event: StreamEdge::Joined,
                user_id: "7".to_string(),
                stream: "news".to_string(),
            }]
        );
        assert_eq!(
            f.store.smembers(&f.keys.stream_users("news")).await.unwrap(),
            vec!["7".to_string()]
        );
        assert_eq!(
            f.store.smembers(&f.keys.user_streams("7")).await.unwrap(),
            vec!["news".to_string()]
        );
    }

    #[tokio::test]
    async fn test_repeated_subscribe_counts_once() {
        let f = fixture();
        let o = &f.observer;
        o.connection_identified(&cid("c1"), &uid("7")).await.unwrap();
        o.connection_subscribed(&cid("c1"), Some(&uid("7")), "news")
            .await
            .unwrap();
        o.connection_subscribed(&cid("c1"), Some(&uid("7")), "news")
            .await
            .unwrap();

        o.connection_destroyed(&cid("c1"), Some(&uid("7"))).await.unwrap();

        let events = stream_events(&f.store).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            PresenceNotification::StreamEvent {
                event: StreamEdge::Left,
                ..
            }
        ));
        assert!(!f.store.contains_key(&f.keys.stream_user_counters("news")).await);
    }

    #[tokio::test]
    async fn test_left_fires_after_last_connection() {
        let f = fixture();
        let o = &f.observer;
        for c in ["c1", "c2"] {
            o.connection_created(&cid(c)).await.unwrap();
            o.connection_identified(&cid(c), &uid("7")).await.unwrap();
            o.connection_subscribed(&cid(c), Some(&uid("7")), "news")
                .await
                .unwrap();
        }

        o.connection_destroyed(&cid("c1"), Some(&uid("7"))).await.unwrap();
        assert_eq!(stream_events(&f.store).await.len(), 1);
        assert_eq!(
            f.store.smembers(f.keys.streams()).await.unwrap(),
            vec!["news".to_string()]
        );

        o.connection_destroyed(&cid("c2"), Some(&uid("7"))).await.unwrap();
        let events = stream_events(&f.store).await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            PresenceNotification::StreamEvent {
                event: StreamEdge::Left,
                user_id: "7".to_string(),
                stream: "news".to_string(),
            }
        );

        // Everything the two connections populated is gone
        assert!(f.store.smembers(f.keys.streams()).await.unwrap().is_empty());
        assert!(f.store.smembers(f.keys.user_ids()).await.unwrap().is_empty());
        assert!(f
            .store
            .smembers(f.keys.connection_ids())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(f.store.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_guest_counts_but_never_joins() {
        let f = fixture();
        let o = &f.observer;
        let guest = UserId::guest();
        o.connection_created(&cid("g1")).await.unwrap();
        o.connection_identified(&cid("g1"), &guest).await.unwrap();
        o.connection_subscribed(&cid("g1"), Some(&guest), "news")
            .await
            .unwrap();
        assert_eq!(o.total_guest_connections(), 1);

        assert!(stream_events(&f.store).await.is_empty());
        assert!(!f.store.contains_key(&f.keys.stream_users("news")).await);
        assert!(!f.store.contains_key(&f.keys.user_streams("0")).await);

        o.connection_destroyed(&cid("g1"), Some(&guest)).await.unwrap();
        assert_eq!(o.total_guest_connections(), 0);
        assert!(stream_events(&f.store).await.is_empty());
        assert!(f.store.smembers(f.keys.streams()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_user_destroy_skips_counter() {
        let f = fixture();
        let o = &f.observer;
        o.connection_identified(&cid("c1"), &uid("7")).await.unwrap();
        o.connection_subscribed(&cid("c1"), Some(&uid("7")), "news")
            .await
            .unwrap();

        o.connection_destroyed(&cid("c1"), None).await.unwrap();

        // Stream and user links are cleaned, the counter is left for the next reset
        assert!(f.store.smembers(f.keys.streams()).await.unwrap().is_empty());
        assert!(f.store.smembers(f.keys.user_ids()).await.unwrap().is_empty());
        assert_eq!(
            f.store
                .hgetall(&f.keys.stream_user_counters("news"))
                .await
                .unwrap()["user-7"],
            "1"
        );
    }

    #[tokio::test]
    async fn test_flags_gate_notifications() {
        let store = Arc::new(MemoryStore::new());
        let flags = Arc::new(RuntimeFlags::new());
        flags.set(FULL_STREAM_UPDATE, true);
        flags.set(STREAM_EVENTS, false);
        let observer = StoreObserver::new(
            store.clone(),
            KeyLayout::default(),
            EVENTS.to_string(),
            flags.clone(),
        );

        observer
            .connection_subscribed(&cid("c1"), Some(&uid("7")), "news")
            .await
            .unwrap();
        assert_eq!(
            stream_events(&store).await,
            vec![PresenceNotification::FullUpdate]
        );

        flags.set(FULL_STREAM_UPDATE, false);
        observer.connection_identified(&cid("c1"), &uid("7")).await.unwrap();
        assert_eq!(stream_events(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_without_streams_sends_full_update() {
        let store = Arc::new(MemoryStore::new());
        let flags = Arc::new(RuntimeFlags::new());
        flags.set(FULL_STREAM_UPDATE, true);
        let observer = StoreObserver::new(
            store.clone(),
            KeyLayout::default(),
            EVENTS.to_string(),
            flags,
        );

        observer.connection_created(&cid("c1")).await.unwrap();
        observer.connection_destroyed(&cid("c1"), None).await.unwrap();

        assert_eq!(
            stream_events(&store).await,
            vec![PresenceNotification::FullUpdate]
        );
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_from_primary_ops() {
        let f = fixture();
        f.store.set_unavailable(true);

        assert!(f.observer.connection_created(&cid("c1")).await.is_err());
        assert!(f.observer.reset().await.is_err());
        // Destroy logs each failed step and carries on
        assert!(f
            .observer
            .connection_destroyed(&cid("c1"), Some(&uid("7")))
            .await
            .is_ok());
    }
}
