//! Coordinator configuration module
//!
//! Loads layered configuration: built-in defaults, then an optional config
//! file named by `PRESENCE_CONFIG_FILE`, then `PRESENCE__*` environment
//! variables (`PRESENCE__REDIS__URL`, `PRESENCE__KEEPALIVE__EXPIRE_TIME_COEFF`, ...).

use crate::error::CoordinatorError;
use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Coordinator configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub redis: RedisConfig,
    pub keys: KeysConfig,
    pub keepalive: KeepaliveConfig,
    pub flags: FlagsConfig,
    pub http: HttpConfig,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: LogLevel,
}

/// Shared store address and the three pub/sub channel names
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// Shard → coordinator lifecycle events
    pub input_channel: String,
    /// Coordinator → shard control messages
    pub output_channel: String,
    /// Derived presence notifications
    pub stream_events_channel: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            input_channel: "meta-bridge-input".to_string(),
            output_channel: "meta-bridge-output".to_string(),
            stream_events_channel: "meta-stream-events".to_string(),
        }
    }
}

/// Names of every key family kept in the shared store
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub connection_ids_set: String,
    pub user_ids_set: String,
    pub streams_set: String,
    pub user_id_to_connection_ids_prefix: String,
    pub user_id_to_streams_prefix: String,
    pub connection_id_to_user_id_prefix: String,
    pub connection_id_to_streams_prefix: String,
    pub connection_id_to_data_prefix: String,
    pub stream_to_connection_ids_prefix: String,
    pub stream_to_user_ids_prefix: String,
    pub stream_to_user_id_connection_counter_prefix: String,
    pub guest_connections_key: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            connection_ids_set: "meta-connection-ids".to_string(),
            user_ids_set: "meta-user-ids".to_string(),
            streams_set: "meta-streams".to_string(),
            user_id_to_connection_ids_prefix: "meta-user-conns-".to_string(),
            user_id_to_streams_prefix: "meta-user-streams-".to_string(),
            connection_id_to_user_id_prefix: "meta-conn-user-".to_string(),
            connection_id_to_streams_prefix: "meta-conn-streams-".to_string(),
            connection_id_to_data_prefix: "meta-conn-data-".to_string(),
            stream_to_connection_ids_prefix: "meta-stream-conns-".to_string(),
            stream_to_user_ids_prefix: "meta-stream-users-".to_string(),
            stream_to_user_id_connection_counter_prefix: "meta-stream-user-counter-".to_string(),
            guest_connections_key: "meta-guest-connections".to_string(),
        }
    }
}

/// Liveness protocol timings (milliseconds)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Expire time of a freshly registered shard
    pub default_expire_time_ms: u64,
    /// Grace period after a `checkAlive` probe before the shard is declared dead
    pub requested_expire_time_ms: u64,
    /// Multiplier applied to the `timeout` a shard announces in `keepAlive`
    pub expire_time_coeff: f64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            default_expire_time_ms: 60_000,
            requested_expire_time_ms: 10_000,
            expire_time_coeff: 1.5,
        }
    }
}

/// Upper bound for any shard expire time
pub const MAX_EXPIRE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

impl KeepaliveConfig {
    pub fn default_expire_time(&self) -> Duration {
        Duration::from_millis(self.default_expire_time_ms)
    }

    pub fn requested_expire_time(&self) -> Duration {
        Duration::from_millis(self.requested_expire_time_ms)
    }

    /// Expire time derived from a shard-announced keepalive timeout.
    ///
    /// Returns None for negative timeouts, which keep the current expire time.
    /// Results are capped at [`MAX_EXPIRE_TIME`].
    pub fn expire_time_for(&self, timeout_ms: f64) -> Option<Duration> {
        if timeout_ms < 0.0 || !timeout_ms.is_finite() {
            return None;
        }
        let expire_time = Duration::try_from_secs_f64(timeout_ms * self.expire_time_coeff / 1000.0)
            .map_or(MAX_EXPIRE_TIME, |d| d.min(MAX_EXPIRE_TIME));
        Some(expire_time)
    }
}

/// Initial values of the runtime presence-notification flags
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlagsConfig {
    pub enable_full_stream_update: bool,
    pub enable_stream_events: bool,
    /// Store hash holding flag overrides; refreshed periodically when set
    pub registry_key: Option<String>,
    pub refresh_interval_ms: u64,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            enable_full_stream_update: true,
            enable_stream_events: true,
            registry_key: None,
            refresh_interval_ms: 5_000,
        }
    }
}

/// Health/metrics HTTP endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

/// Log level directive, kept as text so it can be fed to EnvFilter
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl CoordinatorConfig {
    /// Load configuration from `.env`, the optional config file and the environment
    pub fn from_env() -> Result<Self, CoordinatorError> {
        dotenvy::dotenv().ok();

        let file = env::var("PRESENCE_CONFIG_FILE").ok();
        Self::load(file.as_deref())
    }

    /// Load configuration with priority: environment > file > defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, CoordinatorError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if !Path::new(path).exists() {
                return Err(CoordinatorError::Config(format!(
                    "config file {path} does not exist"
                )));
            }
            builder = builder.add_source(File::with_name(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("PRESENCE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot run with
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        let channels = [
            ("redis.input_channel", &self.redis.input_channel),
            ("redis.output_channel", &self.redis.output_channel),
            ("redis.stream_events_channel", &self.redis.stream_events_channel),
        ];
        for (name, value) in channels {
            if value.is_empty() {
                return Err(CoordinatorError::Config(format!("{name} must not be empty")));
            }
        }

        if self.keepalive.default_expire_time_ms == 0 {
            return Err(CoordinatorError::Config(
                "keepalive.default_expire_time_ms must be positive".to_string(),
            ));
        }
        if self.keepalive.requested_expire_time_ms == 0 {
            return Err(CoordinatorError::Config(
                "keepalive.requested_expire_time_ms must be positive".to_string(),
            ));
        }
        let coeff = self.keepalive.expire_time_coeff;
        if !(coeff > 0.0 && coeff.is_finite()) {
            return Err(CoordinatorError::Config(format!(
                "keepalive.expire_time_coeff must be positive and finite, got {}",
                self.keepalive.expire_time_coeff
            )));
        }
        if self.flags.registry_key.is_some() && self.flags.refresh_interval_ms == 0 {
            return Err(CoordinatorError::Config(
                "flags.refresh_interval_ms must be positive when flags.registry_key is set"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
