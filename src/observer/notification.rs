//! Derived presence notifications published on the stream-events channel

use serde::{Deserialize, Serialize};

/// Direction of a user's membership edge on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEdge {
    Joined,
    Left,
}

/// Wire shape of a presence notification
///
/// ```json
/// {"command":"fullUpdate"}
/// {"command":"streamEvent","event":"joined","userId":"7","stream":"news"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum PresenceNotification {
    FullUpdate,
    StreamEvent {
        event: StreamEdge,
        #[serde(rename = "userId")]
        user_id: String,
        stream: String,
    },
}

impl PresenceNotification {
    /// Static label for metrics
    pub fn command_label(&self) -> &'static str {
        match self {
            Self::FullUpdate => "fullUpdate",
            Self::StreamEvent {
                event: StreamEdge::Joined,
                ..
            } => "streamEvent.joined",
            Self::StreamEvent {
                event: StreamEdge::Left,
                ..
            } => "streamEvent.left",
        }
    }
}
