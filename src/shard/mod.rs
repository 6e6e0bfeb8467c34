//! Shard tracking module
//!
//! A shard is one front-end connection server. Each known shard gets a
//! [`ShardMirror`] of its live connections; [`ShardState`] exposes a
//! summary of all of them to the health endpoints.

mod mirror;
mod state;

pub use mirror::{LocalConnection, ShardMirror};
pub use state::{ShardHealth, ShardState, ShardStateEntry, ShardSummary};

#[cfg(test)]
pub(crate) use mirror::tests::RecordingObserver;
