//! Domain error types for the presence coordinator
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, CoordinatorError>; inbound message
//! validation failures are reported as ProtocolError.

use thiserror::Error;

/// Coordinator domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// Store failures name the operation and the key so an operator can tell
/// which mapping family drifted without parsing the message string.
///
/// Example log output:
/// ```text
/// CoordinatorError::Store { operation: "smembers", key: "conn-streams-42", .. }
/// → "store operation smembers failed on key 'conn-streams-42'"
/// ```
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A shared store command failed (connection lost, timeout, server error)
    #[error("store operation {operation} failed on key '{key}'")]
    Store {
        operation: &'static str,
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A store key holds a value of a different kind than the command expects
    #[error("store key '{key}' holds the wrong kind of value for {operation}")]
    WrongType { operation: &'static str, key: String },

    /// The store is marked unavailable (in-memory store failure injection)
    #[error("store unavailable for {operation}")]
    StoreUnavailable { operation: &'static str },

    /// A store operation did not complete in time
    #[error("store operation {operation} timed out")]
    StoreTimeout { operation: &'static str },

    /// Store connection could not be established
    #[error("store connection failed")]
    StoreConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Outbound payload serialization failed
    #[error("serialization failed for {what}")]
    SerializationFailed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error (missing or invalid value)
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration sources could not be merged or deserialized
    #[error("configuration load failed")]
    ConfigLoad(#[from] config::ConfigError),

    /// Prometheus recorder could not be installed
    #[error("metrics recorder install failed: {0}")]
    MetricsInstall(String),
}

impl CoordinatorError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Store { .. } => "store",
            Self::WrongType { .. } => "wrong_type",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::StoreTimeout { .. } => "store_timeout",
            Self::StoreConnectionFailed(_) => "store_connection",
            Self::SerializationFailed { .. } => "serialization",
            Self::Config(_) => "config",
            Self::ConfigLoad(_) => "config_load",
            Self::MetricsInstall(_) => "metrics_install",
        }
    }

    /// Wrap a redis error with the failing operation and key
    pub fn store(operation: &'static str, key: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Store {
            operation,
            key: key.into(),
            source: Box::new(source),
        }
    }
}

/// Rejection reasons for inbound shard messages.
///
/// A rejected message is logged and dropped; it never changes coordinator
/// state and never renews a shard's liveness timer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not valid JSON
    #[error("unparseable payload: {0}")]
    Unparseable(String),

    /// Payload is valid JSON but not an object
    #[error("message is not a JSON object")]
    NotAnObject,

    /// Envelope has no `id`, or it is neither an integer nor a string
    #[error("no usable id property")]
    MissingId,

    /// Envelope has no `type`, or it is not a string
    #[error("no type property")]
    MissingType,

    /// `type` is not one of the recognized message kinds
    #[error("invalid type value '{0}'")]
    UnknownType(String),

    /// A field required by this message kind is absent or has an unusable value
    #[error("{kind} requires {field} param")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl ProtocolError {
    /// Returns a static label string suitable for Prometheus metrics.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Unparseable(_) => "unparseable",
            Self::NotAnObject => "not_an_object",
            Self::MissingId => "missing_id",
            Self::MissingType => "missing_type",
            Self::UnknownType(_) => "unknown_type",
            Self::MissingField { .. } => "missing_field",
        }
    }
}
