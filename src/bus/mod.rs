//! Pub/sub transport between shards and the coordinator
//!
//! Shards publish lifecycle events on the input channel and listen for
//! control messages on the output channel.

mod publisher;
mod subscriber;

pub use publisher::ControlPublisher;
pub use subscriber::InputSubscriber;
