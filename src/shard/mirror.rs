//! Per-shard in-memory mirror
//!
//! Holds the coordinator's authoritative copy of one front-end server's live
//! connections and forwards every applied event to the presence observer.

use crate::ids::{ConnectionId, UserId};
use crate::observer::ObserverHandle;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Local view of one live connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalConnection {
    pub user_id: Option<UserId>,
    pub streams: Vec<String>,
    pub fields: HashMap<String, String>,
}

/// Mirror of a single shard's connections.
///
/// Ordered by connection id so that [`ShardMirror::clear`] replays destroys
/// in a deterministic order.
pub struct ShardMirror {
    connections: BTreeMap<ConnectionId, LocalConnection>,
    observer: ObserverHandle,
}

impl ShardMirror {
    pub fn new(observer: ObserverHandle) -> Self {
        Self {
            connections: BTreeMap::new(),
            observer,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<&LocalConnection> {
        self.connections.get(connection_id)
    }

    pub fn connection_created(&mut self, connection_id: ConnectionId) {
        debug!(connection_id = %connection_id, "Connection created");
        self.connections
            .insert(connection_id.clone(), LocalConnection::default());
        self.observer.connection_created(connection_id);
    }

    pub fn field_set(&mut self, connection_id: ConnectionId, key: Option<String>, value: Option<String>) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            warn!(connection_id = %connection_id, "Field set on unknown connection; ignoring");
            return;
        };
        if let (Some(key), Some(value)) = (&key, &value) {
            connection.fields.insert(key.clone(), value.clone());
        }
        self.observer.connection_field_set(connection_id, key, value);
    }

    pub fn identified(&mut self, connection_id: ConnectionId, user_id: UserId) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            warn!(
                connection_id = %connection_id,
                user_id = %user_id,
                "Identification of unknown connection; ignoring"
            );
            return;
        };
        connection.user_id = Some(user_id.clone());
        self.observer.connection_identified(connection_id, user_id);
    }

    pub fn subscribed(&mut self, connection_id: ConnectionId, user_id: Option<UserId>, stream: String) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            warn!(
                connection_id = %connection_id,
                stream,
                "Subscribe from unknown connection; ignoring"
            );
            return;
        };
        if !connection.streams.contains(&stream) {
            connection.streams.push(stream.clone());
        }
        self.observer
            .connection_subscribed(connection_id, user_id, stream);
    }

    /// Remove the connection and forward the destroy, whether or not it was known
    pub fn destroyed(&mut self, connection_id: ConnectionId, user_id: Option<UserId>) {
        if self.connections.remove(&connection_id).is_none() {
            debug!(connection_id = %connection_id, "Destroy of connection not in mirror");
        }
        self.observer.connection_destroyed(connection_id, user_id);
    }

    /// Destroy every connection still present, through the same path as an
    /// explicit disconnect. Returns how many were destroyed.
    pub fn clear(&mut self) -> usize {
        let snapshot: Vec<(ConnectionId, Option<UserId>)> = self
            .connections
            .iter()
            .map(|(id, connection)| (id.clone(), connection.user_id.clone()))
            .collect();

        let count = snapshot.len();
        for (connection_id, user_id) in snapshot {
            self.destroyed(connection_id, user_id);
        }
        count
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::observer::PresenceObserver;
    use crate::store::StoreResult;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Observer that records every call it receives
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn user(user_id: Option<&UserId>) -> String {
        user_id.map_or("-".to_string(), |u| u.to_string())
    }

    #[async_trait]
    impl PresenceObserver for RecordingObserver {
        async fn reset(&self) -> StoreResult<()> {
            self.record("reset".to_string());
            Ok(())
        }

        async fn connection_created(&self, connection_id: &ConnectionId) -> StoreResult<()> {
            self.record(format!("created {connection_id}"));
            Ok(())
        }

        async fn connection_field_set(
            &self,
            connection_id: &ConnectionId,
            name: Option<&str>,
            value: Option<&str>,
        ) -> StoreResult<()> {
            self.record(format!(
                "field {connection_id} {}={}",
                name.unwrap_or("-"),
                value.unwrap_or("-")
            ));
            Ok(())
        }

        async fn connection_identified(
            &self,
            connection_id: &ConnectionId,
            user_id: &UserId,
        ) -> StoreResult<()> {
            self.record(format!("identified {connection_id} {user_id}"));
            Ok(())
        }

        async fn connection_subscribed(
            &self,
            connection_id: &ConnectionId,
            user_id: Option<&UserId>,
            stream: &str,
        ) -> StoreResult<()> {
            self.record(format!("subscribed {connection_id} {} {stream}", user(user_id)));
            Ok(())
        }

        async fn connection_destroyed(
            &self,
            connection_id: &ConnectionId,
            user_id: Option<&UserId>,
        ) -> StoreResult<()> {
            self.record(format!("destroyed {connection_id} {}", user(user_id)));
            Ok(())
        }

        fn total_guest_connections(&self) -> i64 {
            0
        }
    }

    fn mirror() -> (ShardMirror, Arc<RecordingObserver>) {
        let recorder = Arc::new(RecordingObserver::default());
        let handle = ObserverHandle::spawn(recorder.clone());
        (ShardMirror::new(handle.clone()), recorder)
    }

    fn cid(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[tokio::test]
    async fn test_events_update_local_view_and_forward() {
        let (mut mirror, recorder) = mirror();

        mirror.connection_created(cid("c1"));
        mirror.field_set(cid("c1"), Some("ip".to_string()), Some("10.0.0.1".to_string()));
        mirror.identified(cid("c1"), UserId::new("7"));
        mirror.subscribed(cid("c1"), Some(UserId::new("7")), "news".to_string());
        mirror.subscribed(cid("c1"), Some(UserId::new("7")), "news".to_string());

        let local = mirror.get(&cid("c1")).unwrap();
        assert_eq!(local.user_id, Some(UserId::new("7")));
        assert_eq!(local.streams, vec!["news".to_string()]);
        assert_eq!(local.fields["ip"], "10.0.0.1");

        mirror.observer.flush().await;
        assert_eq!(
            recorder.calls(),
            vec![
                "created c1",
                "field c1 ip=10.0.0.1",
                "identified c1 7",
                "subscribed c1 7 news",
                "subscribed c1 7 news",
            ]
        );
    }

    #[tokio::test]
    async fn test_events_for_unknown_connection_are_ignored() {
        let (mut mirror, recorder) = mirror();

        mirror.field_set(cid("ghost"), Some("k".to_string()), Some("v".to_string()));
        mirror.identified(cid("ghost"), UserId::new("7"));
        mirror.subscribed(cid("ghost"), None, "news".to_string());

        mirror.observer.flush().await;
        assert!(recorder.calls().is_empty());
        assert!(mirror.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_forwards_even_when_unknown() {
        let (mut mirror, recorder) = mirror();

        mirror.destroyed(cid("ghost"), Some(UserId::new("7")));

        mirror.observer.flush().await;
        assert_eq!(recorder.calls(), vec!["destroyed ghost 7"]);
    }

    #[tokio::test]
    async fn test_clear_destroys_every_connection_with_last_known_user() {
        let (mut mirror, recorder) = mirror();
        for id in ["c", "a", "b"] {
            mirror.connection_created(cid(id));
        }
        mirror.identified(cid("b"), UserId::new("9"));

        assert_eq!(mirror.clear(), 3);
        assert!(mirror.is_empty());
        // Clearing an empty mirror is a no-op
        assert_eq!(mirror.clear(), 0);

        mirror.observer.flush().await;
        let calls = recorder.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &["destroyed a -", "destroyed b 9", "destroyed c -"]
        );
    }
}
