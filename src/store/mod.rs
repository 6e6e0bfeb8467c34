//! Shared store access
//!
//! The coordinator talks to the shared key-value/set/hash/pub-sub backend
//! only through the narrow [`StoreClient`] capability trait. Production uses
//! [`RedisStore`]; [`MemoryStore`] implements the same semantics in-process.

mod keys;
mod memory;
mod redis_store;

pub use self::keys::KeyLayout;
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::error::CoordinatorError;
use async_trait::async_trait;
use std::collections::HashMap;

pub type StoreResult<T> = Result<T, CoordinatorError>;

/// Capability-style client for the shared store.
///
/// Every operation is atomic on its own key; nothing here spans keys. Set and
/// hash removals that leave the container empty delete the key, and counters
/// absent from the store start at zero.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Add a member to a set; true when it was not already a member
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Remove a member from a set
    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;

    /// All members of a set (empty when the key does not exist)
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Delete a key of any kind
    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Set a string value
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Read a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// Add `delta` to an integer hash field and return the new value
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Delete a hash field
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()>;

    /// Number of fields in a hash
    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    /// Every field of a hash
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Increment an integer key and return the new value
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Decrement an integer key and return the new value
    async fn decr(&self, key: &str) -> StoreResult<i64>;

    /// Publish a message on a pub/sub channel
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;
}
