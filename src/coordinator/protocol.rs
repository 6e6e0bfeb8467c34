//! Inbound shard protocol
//!
//! Shards publish JSON envelopes `{"id": <shardId>, "type": <kind>, ...}` on
//! the input channel. Parsing validates the envelope and every field the kind
//! requires before anything touches coordinator state.

use crate::error::ProtocolError;
use crate::ids::{ConnectionId, ShardId, UserId};
use serde_json::{Map, Value};

pub const NEW_CONNECTION: &str = "userConnectionNewEvent";
pub const ADD_FIELD: &str = "userConnectionAddField";
pub const IDENTIFICATION: &str = "userConnectionIdentificationEvent";
pub const SUBSCRIBE: &str = "userConnectionSubscribe";
pub const DESTROY: &str = "userConnectionDestroyEvent";
pub const SYNC_WITH_STATE: &str = "syncWithState";
pub const KEEP_ALIVE: &str = "keepAlive";

/// A validated inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub shard_id: ShardId,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    NewConnection {
        connection_id: ConnectionId,
    },
    /// `key` and `value` must be present but may be null
    AddField {
        connection_id: ConnectionId,
        key: Option<String>,
        value: Option<String>,
    },
    Identification {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Subscribe {
        connection_id: ConnectionId,
        user_id: Option<UserId>,
        stream: String,
    },
    Destroy {
        connection_id: ConnectionId,
        user_id: Option<UserId>,
    },
    /// Raw commands; each is validated when it is replayed
    SyncWithState {
        commands: Vec<Value>,
    },
    /// Timeout in milliseconds; negative keeps the current expire time
    KeepAlive {
        timeout: f64,
    },
}

impl MessageKind {
    /// Wire name of the kind, also used as a metric label
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::NewConnection { .. } => NEW_CONNECTION,
            Self::AddField { .. } => ADD_FIELD,
            Self::Identification { .. } => IDENTIFICATION,
            Self::Subscribe { .. } => SUBSCRIBE,
            Self::Destroy { .. } => DESTROY,
            Self::SyncWithState { .. } => SYNC_WITH_STATE,
            Self::KeepAlive { .. } => KEEP_ALIVE,
        }
    }
}

impl InboundMessage {
    /// Parse a raw channel payload
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| ProtocolError::Unparseable(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate an already-decoded message, as found inside `syncWithState`
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let shard_id = object
            .get("id")
            .and_then(ShardId::from_json)
            .ok_or(ProtocolError::MissingId)?;
        let kind_name = match object.get("type") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(ProtocolError::MissingType),
        };

        let kind = match kind_name.as_str() {
            NEW_CONNECTION => MessageKind::NewConnection {
                connection_id: connection_id(&object, NEW_CONNECTION)?,
            },
            ADD_FIELD => MessageKind::AddField {
                connection_id: connection_id(&object, ADD_FIELD)?,
                key: nullable_text(&object, ADD_FIELD, "key")?,
                value: nullable_text(&object, ADD_FIELD, "value")?,
            },
            IDENTIFICATION => MessageKind::Identification {
                connection_id: connection_id(&object, IDENTIFICATION)?,
                user_id: user_id(&object, IDENTIFICATION)?.ok_or(missing(IDENTIFICATION, "userId"))?,
            },
            SUBSCRIBE => MessageKind::Subscribe {
                connection_id: connection_id(&object, SUBSCRIBE)?,
                user_id: user_id(&object, SUBSCRIBE)?,
                stream: nullable_text(&object, SUBSCRIBE, "channel")?
                    .ok_or(missing(SUBSCRIBE, "channel"))?,
            },
            DESTROY => MessageKind::Destroy {
                connection_id: connection_id(&object, DESTROY)?,
                user_id: user_id(&object, DESTROY)?,
            },
            SYNC_WITH_STATE => match object.remove("commands") {
                Some(Value::Array(commands)) => MessageKind::SyncWithState { commands },
                _ => return Err(missing(SYNC_WITH_STATE, "commands")),
            },
            KEEP_ALIVE => MessageKind::KeepAlive {
                timeout: object
                    .get("timeout")
                    .and_then(Value::as_f64)
                    .ok_or(missing(KEEP_ALIVE, "timeout"))?,
            },
            _ => return Err(ProtocolError::UnknownType(kind_name)),
        };

        Ok(Self { shard_id, kind })
    }
}

fn missing(kind: &'static str, field: &'static str) -> ProtocolError {
    ProtocolError::MissingField { kind, field }
}

fn connection_id(object: &Map<String, Value>, kind: &'static str) -> Result<ConnectionId, ProtocolError> {
    object
        .get("connectionId")
        .and_then(ConnectionId::from_json)
        .ok_or(missing(kind, "connectionId"))
}

/// The field must be present; null and the `-1` sentinel mean "unknown"
fn user_id(object: &Map<String, Value>, kind: &'static str) -> Result<Option<UserId>, ProtocolError> {
    let value = object.get("userId").ok_or(missing(kind, "userId"))?;
    UserId::from_json(value).map_err(|()| missing(kind, "userId"))
}

/// The field must be present; null is carried as `None`
fn nullable_text(
    object: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match object.get(field) {
        None => Err(missing(kind, field)),
        Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(missing(kind, field)),
    }
}
