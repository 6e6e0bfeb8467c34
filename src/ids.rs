//! Identifier types for shards, connections and users
//!
//! Shards announce themselves with either integer or string ids and expect
//! control messages to echo the id back with the same JSON type, so
//! [`ShardId`] keeps the distinction. Connection and user ids only ever end
//! up inside store keys and are normalized to strings.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Identity of one front-end connection server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum ShardId {
    Num(i64),
    Text(String),
}

impl ShardId {
    /// Accepts integer and string JSON values
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Num),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Num(n) => Value::from(*n),
            Self::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for ShardId {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

/// Stringify an opaque scalar id (string or number)
fn opaque(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Identity of one live duplex connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        opaque(value).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an end user; `0` is the guest sentinel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub const GUEST: &'static str = "0";
    const UNKNOWN: &'static str = "-1";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn guest() -> Self {
        Self(Self::GUEST.to_string())
    }

    /// Parse a wire user id. `null` and the `-1` sentinel both mean
    /// "not identified" and yield `Ok(None)`; non-scalar values are `Err`.
    pub fn from_json(value: &Value) -> Result<Option<Self>, ()> {
        if value.is_null() {
            return Ok(None);
        }
        let id = opaque(value).ok_or(())?;
        if id == Self::UNKNOWN {
            return Ok(None);
        }
        Ok(Some(Self(id)))
    }

    /// Parse a user id read back from the store
    pub fn from_stored(raw: String) -> Option<Self> {
        if raw == Self::UNKNOWN {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn is_guest(&self) -> bool {
        self.0 == Self::GUEST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
