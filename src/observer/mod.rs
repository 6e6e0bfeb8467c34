//! Relational state store
//!
//! Maintains the global many-to-many mapping between connections, users and
//! streams in the shared store, and derives join/leave presence edges from
//! per-user connection counters.

mod notification;
mod store_observer;
mod worker;

pub use notification::{PresenceNotification, StreamEdge};
pub use store_observer::StoreObserver;
pub use worker::ObserverHandle;

use crate::ids::{ConnectionId, UserId};
use crate::store::StoreResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// Sink for connection lifecycle events that keeps global presence state.
#[async_trait]
pub trait PresenceObserver: Send + Sync {
    /// Wipe every mapping family and the guest counter
    async fn reset(&self) -> StoreResult<()>;

    async fn connection_created(&self, connection_id: &ConnectionId) -> StoreResult<()>;

    /// Store an arbitrary attribute; a missing name or value is logged and ignored
    async fn connection_field_set(
        &self,
        connection_id: &ConnectionId,
        name: Option<&str>,
        value: Option<&str>,
    ) -> StoreResult<()>;

    async fn connection_identified(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
    ) -> StoreResult<()>;

    async fn connection_subscribed(
        &self,
        connection_id: &ConnectionId,
        user_id: Option<&UserId>,
        stream: &str,
    ) -> StoreResult<()>;

    async fn connection_destroyed(
        &self,
        connection_id: &ConnectionId,
        user_id: Option<&UserId>,
    ) -> StoreResult<()>;

    /// Last known guest counter value
    fn total_guest_connections(&self) -> i64;

    /// True for stand-ins that do not persist anything
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Stand-in used when the store could not be reset at startup.
///
/// Connection-protocol handling keeps running; nothing is persisted.
#[derive(Debug, Default)]
pub struct NoopObserver;

#[async_trait]
impl PresenceObserver for NoopObserver {
    async fn reset(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn connection_created(&self, _: &ConnectionId) -> StoreResult<()> {
        Ok(())
    }

    async fn connection_field_set(
        &self,
        _: &ConnectionId,
        _: Option<&str>,
        _: Option<&str>,
    ) -> StoreResult<()> {
        Ok(())
    }

    async fn connection_identified(&self, _: &ConnectionId, _: &UserId) -> StoreResult<()> {
        Ok(())
    }

    async fn connection_subscribed(
        &self,
        _: &ConnectionId,
        _: Option<&UserId>,
        _: &str,
    ) -> StoreResult<()> {
        Ok(())
    }

    async fn connection_destroyed(&self, _: &ConnectionId, _: Option<&UserId>) -> StoreResult<()> {
        Ok(())
    }

    fn total_guest_connections(&self) -> i64 {
        0
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

/// Reset the store before any shard traffic is accepted.
///
/// The store holds no independently recoverable truth, so it is always
/// wiped; shards rebuild it through resync. If the wipe fails the observer
/// is replaced by [`NoopObserver`].
pub async fn bootstrap_observer<O>(observer: O) -> Arc<dyn PresenceObserver>
where
    O: PresenceObserver + 'static,
{
    match observer.reset().await {
        Ok(()) => {
            info!("Presence store reset complete");
            Arc::new(observer)
        }
        Err(e) => {
            error!(
                error = %e,
                "Could not initialize presence observer - running without persistence"
            );
            Arc::new(NoopObserver)
        }
    }
}
