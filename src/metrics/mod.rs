//! Prometheus metrics module
//!
//! Recording helpers are free functions over the global `metrics` recorder,
//! so the coordinator core records the same way whether or not an exporter
//! is installed (tests run without one).

use crate::error::CoordinatorError;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Prometheus exporter handle
#[derive(Clone)]
pub struct CoordinatorMetrics {
    handle: Arc<PrometheusHandle>,
}

impl CoordinatorMetrics {
    /// Install the global Prometheus recorder
    pub fn install() -> Result<Self, CoordinatorError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| CoordinatorError::MetricsInstall(e.to_string()))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "presence_messages_received_total",
            Unit::Count,
            "Shard messages accepted, by message type"
        );
        describe_counter!(
            "presence_messages_rejected_total",
            Unit::Count,
            "Shard messages rejected, by reason"
        );
        describe_counter!(
            "presence_keepalive_probes_total",
            Unit::Count,
            "checkAlive probes sent"
        );
        describe_counter!(
            "presence_shards_expired_total",
            Unit::Count,
            "Shards declared dead by the keepalive protocol"
        );
        describe_counter!(
            "presence_resync_requests_total",
            Unit::Count,
            "requestSync/requestSyncAll messages sent"
        );
        describe_counter!(
            "presence_store_errors_total",
            Unit::Count,
            "Failed shared store operations"
        );
        describe_counter!(
            "presence_notifications_total",
            Unit::Count,
            "Presence notifications published, by command"
        );

        describe_gauge!("presence_shards_known", Unit::Count, "Shards with a mirror");
        describe_gauge!(
            "presence_connections_mirrored",
            Unit::Count,
            "Connections held across all shard mirrors"
        );
        describe_gauge!(
            "presence_guest_connections",
            Unit::Count,
            "Last known guest connection counter"
        );
        describe_gauge!(
            "presence_subscriber_connected",
            Unit::Count,
            "Input channel subscription status (1=connected, 0=disconnected)"
        );
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

pub fn record_message(message_type: &'static str) {
    counter!("presence_messages_received_total", "type" => message_type).increment(1);
}

pub fn record_rejected(reason: &'static str) {
    counter!("presence_messages_rejected_total", "reason" => reason).increment(1);
}

pub fn record_probe() {
    counter!("presence_keepalive_probes_total").increment(1);
}

pub fn record_shard_expired() {
    counter!("presence_shards_expired_total").increment(1);
}

pub fn record_resync_request(scope: &'static str) {
    counter!("presence_resync_requests_total", "scope" => scope).increment(1);
}

pub fn record_store_error(operation: &'static str, error_type: &'static str) {
    counter!(
        "presence_store_errors_total",
        "operation" => operation,
        "error_type" => error_type
    )
    .increment(1);
}

pub fn record_notification(command: &'static str) {
    counter!("presence_notifications_total", "command" => command).increment(1);
}

pub fn set_shards_known(count: usize) {
    gauge!("presence_shards_known").set(count as f64);
}

pub fn set_connections_mirrored(count: usize) {
    gauge!("presence_connections_mirrored").set(count as f64);
}

pub fn set_guest_connections(count: i64) {
    gauge!("presence_guest_connections").set(count as f64);
}

pub fn set_subscriber_connected(connected: bool) {
    gauge!("presence_subscriber_connected").set(if connected { 1.0 } else { 0.0 });
}
