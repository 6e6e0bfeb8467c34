//! Redis-backed store client

use super::{StoreClient, StoreResult};
use crate::error::CoordinatorError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Store client over a single multiplexed, auto-reconnecting Redis connection.
///
/// The connection is established on first use, so a store that is down at
/// startup surfaces as failed operations instead of a failed constructor.
pub struct RedisStore {
    client: Client,
    manager: OnceCell<ConnectionManager>,
}

impl RedisStore {
    /// Create a store client for `url`. Only URL parsing can fail here.
    pub fn open(url: &str) -> Result<Self, CoordinatorError> {
        let client = Client::open(url)
            .map_err(|e| CoordinatorError::Config(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client,
            manager: OnceCell::new(),
        })
    }

    /// The underlying client, for opening dedicated pub/sub connections
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                info!("Connecting to Redis");
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "Redis connection failed");
                        CoordinatorError::StoreConnectionFailed(Box::new(e))
                    })
            })
            .await?;

        Ok(manager.clone())
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let added: i64 = conn
            .sadd(key, member)
            .await
            .map_err(|e| CoordinatorError::store("sadd", key, e))?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        conn.srem::<_, _, ()>(key, member)
            .await
            .map_err(|e| CoordinatorError::store("srem", key, e))
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection().await?;
        conn.smembers(key)
            .await
            .map_err(|e| CoordinatorError::store("smembers", key, e))
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| CoordinatorError::store("del", key, e))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| CoordinatorError::store("set", key, e))
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(key)
            .await
            .map_err(|e| CoordinatorError::store("get", key, e))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|e| CoordinatorError::store("hset", key, e))
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        conn.hincr(key, field, delta)
            .await
            .map_err(|e| CoordinatorError::store("hincrby", key, e))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(key, field)
            .await
            .map_err(|e| CoordinatorError::store("hdel", key, e))
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.connection().await?;
        conn.hlen(key)
            .await
            .map_err(|e| CoordinatorError::store("hlen", key, e))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        conn.hgetall(key)
            .await
            .map_err(|e| CoordinatorError::store("hgetall", key, e))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        conn.incr(key, 1_i64)
            .await
            .map_err(|e| CoordinatorError::store("incr", key, e))
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        conn.decr(key, 1_i64)
            .await
            .map_err(|e| CoordinatorError::store("decr", key, e))
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        conn.publish::<_, _, ()>(channel, message)
            .await
            .map_err(|e| CoordinatorError::store("publish", channel, e))
    }
}
