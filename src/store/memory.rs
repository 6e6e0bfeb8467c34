//! In-process store client
//!
//! Mirrors the Redis semantics the coordinator relies on: empty sets and
//! hashes vanish, missing counters read as zero, and every publish is kept
//! so callers can inspect what went out.

use super::{StoreClient, StoreResult};
use crate::error::CoordinatorError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Value>,
    published: Vec<(String, String)>,
}

/// Store client holding all data in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages published so far, as (channel, payload)
    pub async fn published(&self) -> Vec<(String, String)> {
        self.inner.lock().await.published.clone()
    }

    /// Payloads published on one channel
    pub async fn published_on(&self, channel: &str) -> Vec<String> {
        self.inner
            .lock()
            .await
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Number of keys currently present
    pub async fn key_count(&self) -> usize {
        self.inner.lock().await.values.len()
    }

    /// Whether a key is present
    pub async fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().await.values.contains_key(key)
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinatorError::StoreUnavailable { operation });
        }
        Ok(())
    }
}

fn wrong_type(operation: &'static str, key: &str) -> CoordinatorError {
    CoordinatorError::WrongType {
        operation,
        key: key.to_string(),
    }
}

fn parse_counter(operation: &'static str, key: &str, raw: &str) -> StoreResult<i64> {
    raw.parse::<i64>().map_err(|_| wrong_type(operation, key))
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check("sadd")?;
        let mut inner = self.inner.lock().await;
        match inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(BTreeSet::new()))
        {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type("sadd", key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check("srem")?;
        let mut inner = self.inner.lock().await;
        let now_empty = match inner.values.get_mut(key) {
            None => return Ok(()),
            Some(Value::Set(set)) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type("srem", key)),
        };
        if now_empty {
            inner.values.remove(key);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check("smembers")?;
        let inner = self.inner.lock().await;
        match inner.values.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type("smembers", key)),
        }
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.check("del")?;
        self.inner.lock().await.values.remove(key);
        Ok(())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check("set")?;
        self.inner
            .lock()
            .await
            .values
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check("get")?;
        let inner = self.inner.lock().await;
        match inner.values.get(key) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type("get", key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.check("hset")?;
        let mut inner = self.inner.lock().await;
        match inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(BTreeMap::new()))
        {
            Value::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(wrong_type("hset", key)),
        }
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.check("hincrby")?;
        let mut inner = self.inner.lock().await;
        match inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(BTreeMap::new()))
        {
            Value::Hash(hash) => {
                let current = match hash.get(field) {
                    Some(raw) => parse_counter("hincrby", key, raw)?,
                    None => 0,
                };
                let next = current + delta;
                hash.insert(field.to_string(), next.to_string());
                Ok(next)
            }
            _ => Err(wrong_type("hincrby", key)),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        self.check("hdel")?;
        let mut inner = self.inner.lock().await;
        let now_empty = match inner.values.get_mut(key) {
            None => return Ok(()),
            Some(Value::Hash(hash)) => {
                hash.remove(field);
                hash.is_empty()
            }
            Some(_) => return Err(wrong_type("hdel", key)),
        };
        if now_empty {
            inner.values.remove(key);
        }
        Ok(())
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.check("hlen")?;
        let inner = self.inner.lock().await;
        match inner.values.get(key) {
            None => Ok(0),
            Some(Value::Hash(hash)) => Ok(hash.len()),
            Some(_) => Err(wrong_type("hlen", key)),
        }
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check("hgetall")?;
        let inner = self.inner.lock().await;
        match inner.values.get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            Some(_) => Err(wrong_type("hgetall", key)),
        }
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.check("incr")?;
        add_to_counter(&mut *self.inner.lock().await, "incr", key, 1)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.check("decr")?;
        add_to_counter(&mut *self.inner.lock().await, "decr", key, -1)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.check("publish")?;
        self.inner
            .lock()
            .await
            .published
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

fn add_to_counter(inner: &mut Inner, operation: &'static str, key: &str, delta: i64) -> StoreResult<i64> {
    let current = match inner.values.get(key) {
        None => 0,
        Some(Value::Str(raw)) => parse_counter(operation, key, raw)?,
        Some(_) => return Err(wrong_type(operation, key)),
    };
    let next = current + delta;
    inner
        .values
        .insert(key.to_string(), Value::Str(next.to_string()));
    Ok(next)
}
