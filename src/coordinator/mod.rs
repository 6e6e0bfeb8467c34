//! Shard coordinator
//!
//! Owns the table of known shards, each with its [`ShardMirror`] and
//! keepalive state, and processes the inbound channel one message at a time.
//! All shard-table mutation happens on the single task running
//! [`Coordinator::run`], so the table needs no locking.
//!
//! Keepalive is two-phase: a shard that stays silent past its expire time is
//! sent `checkAlive` and moved to probing; if it is still silent when the
//! shorter probe window ends, the shard is declared dead and its mirror is
//! cleared.

mod control;
mod keepalive;
mod protocol;

pub use control::ControlMessage;
pub use keepalive::{ArmedTimer, TimerExpired, TimerQueue};
pub use protocol::{InboundMessage, MessageKind};

use crate::config::KeepaliveConfig;
use crate::error::ProtocolError;
use crate::ids::ShardId;
use crate::metrics;
use crate::observer::ObserverHandle;
use crate::shard::{ShardHealth, ShardMirror, ShardState};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Work submitted to the coordinator loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorInput {
    /// Raw payload received on the input channel
    Message(String),
    CheckAliveAll,
    RequestSyncAll,
}

/// Cloneable submitter for the coordinator loop
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorInput>,
}

impl CoordinatorHandle {
    /// Create a handle and the receiver to pass to [`Coordinator::run`]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoordinatorInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn submit(&self, payload: String) {
        self.send(CoordinatorInput::Message(payload));
    }

    /// Probe every known shard at once
    pub fn check_alive_all(&self) {
        self.send(CoordinatorInput::CheckAliveAll);
    }

    /// Ask every shard to replay its state
    pub fn request_sync_all(&self) {
        self.send(CoordinatorInput::RequestSyncAll);
    }

    fn send(&self, input: CoordinatorInput) {
        if self.tx.send(input).is_err() {
            warn!("Coordinator loop has stopped; dropping input");
        }
    }
}

struct ShardEntry {
    mirror: ShardMirror,
    expire_time: Duration,
    phase: ShardHealth,
    timer: Option<ArmedTimer>,
}

pub struct Coordinator {
    shards: HashMap<ShardId, ShardEntry>,
    observer: ObserverHandle,
    keepalive: KeepaliveConfig,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    timers: TimerQueue,
    expired_rx: mpsc::UnboundedReceiver<TimerExpired>,
    state: ShardState,
}

impl Coordinator {
    pub fn new(
        observer: ObserverHandle,
        keepalive: KeepaliveConfig,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
        state: ShardState,
    ) -> Self {
        let (timers, expired_rx) = TimerQueue::new();
        Self {
            shards: HashMap::new(),
            observer,
            keepalive,
            control_tx,
            timers,
            expired_rx,
            state,
        }
    }

    /// Shared view for health checks
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn phase(&self, shard_id: &ShardId) -> Option<ShardHealth> {
        self.shards.get(shard_id).map(|e| e.phase)
    }

    pub fn mirror(&self, shard_id: &ShardId) -> Option<&ShardMirror> {
        self.shards.get(shard_id).map(|e| &e.mirror)
    }

    /// Run until the input channel closes or shutdown is signalled, then wait
    /// for outstanding store updates.
    pub async fn run(
        mut self,
        mut input_rx: mpsc::UnboundedReceiver<CoordinatorInput>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("Coordinator started");

        loop {
            tokio::select! {
                input = input_rx.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => {
                        info!("Coordinator input closed");
                        break;
                    }
                },
                Some(expired) = self.expired_rx.recv() => {
                    self.keep_alive_timeout(expired);
                }
                _ = shutdown_rx.recv() => {
                    info!("Coordinator received shutdown signal");
                    break;
                }
            }
        }

        self.observer.flush().await;
        info!(shards = self.shards.len(), "Coordinator stopped");
    }

    pub fn handle_input(&mut self, input: CoordinatorInput) {
        match input {
            CoordinatorInput::Message(payload) => {
                self.process_payload(&payload);
            }
            CoordinatorInput::CheckAliveAll => self.check_alive_all(),
            CoordinatorInput::RequestSyncAll => self.request_sync_all(),
        }
    }

    /// Parse and process one raw payload. Returns whether it was accepted.
    pub fn process_payload(&mut self, payload: &str) -> bool {
        match InboundMessage::parse(payload) {
            Ok(message) => self.process_message(message),
            Err(e) => {
                reject(&e, payload);
                false
            }
        }
    }

    fn process_value(&mut self, value: Value) -> bool {
        match InboundMessage::from_value(value.clone()) {
            Ok(message) => self.process_message(message),
            Err(e) => {
                reject(&e, &value.to_string());
                false
            }
        }
    }

    /// Apply a validated message, then renew the shard's liveness timer
    pub fn process_message(&mut self, message: InboundMessage) -> bool {
        let InboundMessage { shard_id, kind } = message;
        metrics::record_message(kind.type_label());

        let mut timeout = None;
        match kind {
            MessageKind::NewConnection { connection_id } => {
                if let Some(mirror) = self.mirror_mut(&shard_id) {
                    mirror.connection_created(connection_id);
                }
            }
            MessageKind::AddField {
                connection_id,
                key,
                value,
            } => {
                if let Some(mirror) = self.mirror_mut(&shard_id) {
                    mirror.field_set(connection_id, key, value);
                }
            }
            MessageKind::Identification {
                connection_id,
                user_id,
            } => {
                if let Some(mirror) = self.mirror_mut(&shard_id) {
                    mirror.identified(connection_id, user_id);
                }
            }
            MessageKind::Subscribe {
                connection_id,
                user_id,
                stream,
            } => {
                if let Some(mirror) = self.mirror_mut(&shard_id) {
                    mirror.subscribed(connection_id, user_id, stream);
                }
            }
            MessageKind::Destroy {
                connection_id,
                user_id,
            } => {
                if let Some(mirror) = self.mirror_mut(&shard_id) {
                    mirror.destroyed(connection_id, user_id);
                }
            }
            MessageKind::SyncWithState { commands } => {
                self.sync_with_state(&shard_id, commands);
            }
            MessageKind::KeepAlive { timeout: t } => timeout = Some(t),
        }

        self.state.record_message(&shard_id);
        self.renew_expire_time(&shard_id, timeout);
        self.update_gauges(&shard_id);
        true
    }

    fn mirror_mut(&mut self, shard_id: &ShardId) -> Option<&mut ShardMirror> {
        match self.shards.get_mut(shard_id) {
            Some(entry) => Some(&mut entry.mirror),
            None => {
                warn!(
                    shard_id = %shard_id,
                    "Update from shard before synchronization; ignoring"
                );
                None
            }
        }
    }

    /// Rebuild a shard's mirror from a full state replay
    fn sync_with_state(&mut self, shard_id: &ShardId, commands: Vec<Value>) {
        info!(shard_id = %shard_id, commands = commands.len(), "Syncing shard state");
        self.reset_or_create_shard(shard_id);

        for command in commands {
            let command = match command {
                Value::Object(mut object) => {
                    object.insert("id".to_string(), shard_id.to_json());
                    Value::Object(object)
                }
                other => other,
            };
            self.process_value(command);
        }
    }

    fn reset_or_create_shard(&mut self, shard_id: &ShardId) {
        let default_expire_time = self.keepalive.default_expire_time();

        match self.shards.get_mut(shard_id) {
            Some(entry) => {
                entry.expire_time = default_expire_time;
                entry.phase = ShardHealth::Normal;
                entry.timer = None;
                let cleared = entry.mirror.clear();
                debug!(shard_id = %shard_id, cleared, "Shard mirror reset");
                self.state.set_health(shard_id, ShardHealth::Normal);
            }
            None => {
                info!(shard_id = %shard_id, "New shard registered");
                self.shards.insert(
                    shard_id.clone(),
                    ShardEntry {
                        mirror: ShardMirror::new(self.observer.clone()),
                        expire_time: default_expire_time,
                        phase: ShardHealth::Normal,
                        timer: None,
                    },
                );
                self.state.register(shard_id.clone());
            }
        }
    }

    fn delete_shard(&mut self, shard_id: &ShardId) {
        let Some(mut entry) = self.shards.remove(shard_id) else {
            error!(shard_id = %shard_id, "Tried to delete unknown shard");
            return;
        };

        entry.timer = None;
        let cleared = entry.mirror.clear();
        self.state.remove(shard_id);
        info!(shard_id = %shard_id, cleared, "Shard removed");
        self.update_gauges(shard_id);
    }

    /// Re-arm the shard's timer in the normal phase.
    ///
    /// A keepAlive timeout scales the expire time by the configured
    /// coefficient; a negative one keeps the current expire time. An unknown
    /// shard is asked to resync instead.
    fn renew_expire_time(&mut self, shard_id: &ShardId, timeout: Option<f64>) {
        let Some(entry) = self.shards.get_mut(shard_id) else {
            warn!(shard_id = %shard_id, "Renewal for unknown shard; requesting resync");
            self.request_sync(shard_id);
            return;
        };

        if let Some(expire_time) = timeout.and_then(|t| self.keepalive.expire_time_for(t)) {
            entry.expire_time = expire_time;
        }
        if entry.phase == ShardHealth::Probing {
            debug!(shard_id = %shard_id, "Shard answered probe");
        }
        entry.phase = ShardHealth::Normal;
        entry.timer = Some(self.timers.arm(shard_id.clone(), entry.expire_time));
        self.state.set_health(shard_id, ShardHealth::Normal);
    }

    fn keep_alive_timeout(&mut self, expired: TimerExpired) {
        let TimerExpired {
            shard_id,
            generation,
        } = expired;

        let Some(entry) = self.shards.get(&shard_id) else {
            debug!(shard_id = %shard_id, "Expiry for removed shard; ignoring");
            return;
        };
        if entry.timer.as_ref().map(ArmedTimer::generation) != Some(generation) {
            debug!(shard_id = %shard_id, generation, "Stale keepalive expiry; ignoring");
            return;
        }

        let phase = entry.phase;
        match phase {
            ShardHealth::Normal => {
                info!(shard_id = %shard_id, "Shard reached keepalive timeout; probing");
                self.check_alive(&shard_id);
            }
            ShardHealth::Probing => {
                error!(shard_id = %shard_id, "Shard went offline (keepalive)");
                metrics::record_shard_expired();
                self.delete_shard(&shard_id);
            }
        }
    }

    fn start_probe(&mut self, shard_id: &ShardId) {
        let requested = self.keepalive.requested_expire_time();
        if let Some(entry) = self.shards.get_mut(shard_id) {
            entry.phase = ShardHealth::Probing;
            entry.timer = Some(self.timers.arm(shard_id.clone(), requested));
            self.state.set_health(shard_id, ShardHealth::Probing);
        }
    }

    /// Probe one shard and arm its probe window
    pub fn check_alive(&mut self, shard_id: &ShardId) {
        self.start_probe(shard_id);
        metrics::record_probe();
        self.send(ControlMessage::CheckAlive {
            id: shard_id.clone(),
        });
    }

    /// Probe every shard with a single broadcast
    pub fn check_alive_all(&mut self) {
        let shard_ids: Vec<ShardId> = self.shards.keys().cloned().collect();
        info!(shards = shard_ids.len(), "Probing all shards");
        for shard_id in &shard_ids {
            self.start_probe(shard_id);
        }
        metrics::record_probe();
        self.send(ControlMessage::CheckAliveAll);
    }

    pub fn request_sync(&self, shard_id: &ShardId) {
        metrics::record_resync_request("shard");
        self.send(ControlMessage::RequestSync {
            id: shard_id.clone(),
        });
    }

    pub fn request_sync_all(&self) {
        info!("Requesting state sync from all shards");
        metrics::record_resync_request("all");
        self.send(ControlMessage::RequestSyncAll);
    }

    fn send(&self, message: ControlMessage) {
        debug!(message = message.type_label(), "Queueing control message");
        if self.control_tx.send(message).is_err() {
            warn!("Control publisher has stopped; dropping control message");
        }
    }

    fn update_gauges(&self, shard_id: &ShardId) {
        if let Some(entry) = self.shards.get(shard_id) {
            self.state.set_connections(shard_id, entry.mirror.len());
        }
        metrics::set_shards_known(self.shards.len());
        metrics::set_connections_mirrored(self.shards.values().map(|e| e.mirror.len()).sum());
        metrics::set_guest_connections(self.observer.total_guest_connections());
    }
}

fn reject(error: &ProtocolError, payload: &str) {
    warn!(reason = %error, payload, "Rejected shard message");
    metrics::record_rejected(error.error_type_label());
}
