//! Outbound control messages (coordinator → shards)

use crate::ids::ShardId;
use serde::Serialize;

/// Control message published on the output channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Ask one shard to replay its full state via `syncWithState`
    RequestSync { id: ShardId },
    RequestSyncAll,
    /// Liveness probe for one shard
    CheckAlive { id: ShardId },
    CheckAliveAll,
}

impl ControlMessage {
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::RequestSync { .. } => "requestSync",
            Self::RequestSyncAll => "requestSyncAll",
            Self::CheckAlive { .. } => "checkAlive",
            Self::CheckAliveAll => "checkAliveAll",
        }
    }
}
