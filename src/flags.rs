//! Runtime feature flags gating presence notifications
//!
//! Flags are read at send time. A flag that is off drops the notification;
//! nothing is queued for later.

use crate::config::FlagsConfig;
use crate::store::StoreClient;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Gates `{"command":"fullUpdate"}` notifications
pub const FULL_STREAM_UPDATE: &str = "enable-full-stream-update";
/// Gates `{"command":"streamEvent"}` joined/left notifications
pub const STREAM_EVENTS: &str = "enable-stream-events";

/// Process-wide flag lookup
pub trait FlagSource: Send + Sync {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Concurrent flag table, toggleable while the coordinator runs
#[derive(Debug, Clone, Default)]
pub struct RuntimeFlags {
    flags: Arc<DashMap<String, bool>>,
}

impl RuntimeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the two notification flags from configuration
    pub fn from_config(config: &FlagsConfig) -> Self {
        let flags = Self::new();
        flags.set(FULL_STREAM_UPDATE, config.enable_full_stream_update);
        flags.set(STREAM_EVENTS, config.enable_stream_events);
        flags
    }

    pub fn set(&self, flag: &str, enabled: bool) {
        let previous = self.flags.insert(flag.to_string(), enabled);
        if previous != Some(enabled) {
            info!(flag, enabled, "Feature flag changed");
        }
    }

    /// Apply a registry snapshot; `"true"` enables, anything else disables
    pub fn apply_registry(&self, entries: impl IntoIterator<Item = (String, String)>) {
        for (flag, value) in entries {
            self.set(&flag, value == "true");
        }
    }
}

impl FlagSource for RuntimeFlags {
    fn is_enabled(&self, flag: &str) -> bool {
        self.flags.get(flag).map(|v| *v).unwrap_or(false)
    }
}

/// Periodically pull flag overrides from a store hash until shutdown
pub async fn run_registry_refresh(
    flags: RuntimeFlags,
    store: Arc<dyn StoreClient>,
    registry_key: String,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(registry_key, ?interval, "Starting flag registry refresh");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.hgetall(&registry_key).await {
                    Ok(entries) => {
                        debug!(registry_key, entries = entries.len(), "Flag registry refreshed");
                        flags.apply_registry(entries);
                    }
                    Err(e) => {
                        warn!(registry_key, error = %e, "Failed to refresh flag registry");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Flag registry refresh stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_unknown_flag_is_disabled() {
        let flags = RuntimeFlags::new();
        assert!(!flags.is_enabled("enable-anything"));
    }

    #[test]
    fn test_seeded_from_config() {
        let flags = RuntimeFlags::from_config(&FlagsConfig {
            enable_full_stream_update: false,
            enable_stream_events: true,
            ..FlagsConfig::default()
        });

        assert!(!flags.is_enabled(FULL_STREAM_UPDATE));
        assert!(flags.is_enabled(STREAM_EVENTS));
    }

    #[test]
    fn test_registry_values_are_strict_true() {
        let flags = RuntimeFlags::new();
        flags.apply_registry(vec![
            (FULL_STREAM_UPDATE.to_string(), "true".to_string()),
            (STREAM_EVENTS.to_string(), "yes".to_string()),
        ]);

        assert!(flags.is_enabled(FULL_STREAM_UPDATE));
        assert!(!flags.is_enabled(STREAM_EVENTS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_refresh_applies_store_hash() {
        let store = Arc::new(MemoryStore::new());
        store.hset("registry", STREAM_EVENTS, "false").await.unwrap();

        let flags = RuntimeFlags::new();
        flags.set(STREAM_EVENTS, true);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_registry_refresh(
            flags.clone(),
            store.clone(),
            "registry".to_string(),
            Duration::from_secs(1),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!flags.is_enabled(STREAM_EVENTS));

        store.hset("registry", STREAM_EVENTS, "true").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(flags.is_enabled(STREAM_EVENTS));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
