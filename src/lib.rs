//! Presence coordinator
//!
//! Tracks which connections exist across a fleet of front-end connection
//! servers, which user each belongs to and which streams each is subscribed
//! to, and keeps that registry in a shared Redis store.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod flags;
pub mod health;
pub mod ids;
pub mod metrics;
pub mod observer;
pub mod shard;
pub mod store;
