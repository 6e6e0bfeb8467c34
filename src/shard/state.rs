//! Shard state tracking
//!
//! Read-only view of the coordinator's shard table for the health endpoints.
//! The coordinator owns the real mirrors; this is updated alongside them.

use crate::ids::ShardId;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Keepalive phase of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardHealth {
    /// Traffic seen within the expire window
    Normal,
    /// Silent past the expire window; a checkAlive probe is outstanding
    Probing,
}

impl ShardHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ShardHealth::Normal)
    }
}

/// State for a single shard
#[derive(Debug)]
pub struct ShardStateEntry {
    pub health: ShardHealth,
    pub connections: usize,
    pub messages_received: AtomicU64,
    pub last_message: Option<Instant>,
    pub registered_at: Instant,
}

impl Default for ShardStateEntry {
    fn default() -> Self {
        Self {
            health: ShardHealth::Normal,
            connections: 0,
            messages_received: AtomicU64::new(0),
            last_message: None,
            registered_at: Instant::now(),
        }
    }
}

/// Per-shard summary for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ShardSummary {
    pub id: ShardId,
    pub health: ShardHealth,
    pub connections: usize,
    pub messages_received: u64,
    pub idle_ms: Option<u64>,
}

/// Shared state across all shards known to this coordinator
#[derive(Debug, Clone)]
pub struct ShardState {
    inner: Arc<ShardStateInner>,
}

#[derive(Debug)]
struct ShardStateInner {
    instance_id: String,
    shards: DashMap<ShardId, ShardStateEntry>,
}

impl ShardState {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ShardStateInner {
                instance_id: instance_id.into(),
                shards: DashMap::new(),
            }),
        }
    }

    /// Identifier of this coordinator process
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Start tracking a shard, resetting any previous entry
    pub fn register(&self, shard_id: ShardId) {
        self.inner.shards.insert(shard_id, ShardStateEntry::default());
    }

    pub fn remove(&self, shard_id: &ShardId) {
        self.inner.shards.remove(shard_id);
    }

    pub fn set_health(&self, shard_id: &ShardId, health: ShardHealth) {
        if let Some(mut entry) = self.inner.shards.get_mut(shard_id) {
            entry.health = health;
        }
    }

    pub fn set_connections(&self, shard_id: &ShardId, count: usize) {
        if let Some(mut entry) = self.inner.shards.get_mut(shard_id) {
            entry.connections = count;
        }
    }

    /// Record an accepted message from the shard
    pub fn record_message(&self, shard_id: &ShardId) {
        if let Some(mut entry) = self.inner.shards.get_mut(shard_id) {
            entry.messages_received.fetch_add(1, Ordering::Relaxed);
            entry.last_message = Some(Instant::now());
        }
    }

    pub fn get_health(&self, shard_id: &ShardId) -> Option<ShardHealth> {
        self.inner.shards.get(shard_id).map(|e| e.health)
    }

    pub fn connections(&self, shard_id: &ShardId) -> Option<usize> {
        self.inner.shards.get(shard_id).map(|e| e.connections)
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    pub fn probing_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| !e.health.is_healthy())
            .count()
    }

    pub fn total_connections(&self) -> usize {
        self.inner.shards.iter().map(|e| e.connections).sum()
    }

    pub fn total_messages_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.messages_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn summaries(&self) -> Vec<ShardSummary> {
        let mut summaries: Vec<ShardSummary> = self
            .inner
            .shards
            .iter()
            .map(|e| ShardSummary {
                id: e.key().clone(),
                health: e.health,
                connections: e.connections,
                messages_received: e.messages_received.load(Ordering::Relaxed),
                idle_ms: e.last_message.map(|t| t.elapsed().as_millis() as u64),
            })
            .collect();
        summaries.sort_by_key(|s| s.id.to_string());
        summaries
    }
}
