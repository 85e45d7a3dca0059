//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade, so a detached handle (no
//! exporter installed) records into the no-op recorder. Only the binary
//! installs the Prometheus exporter.

use crate::error::GatewayError;
use crate::events::LifecycleKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::MetricsInstall(e.to_string()))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Metrics handle without an exporter
    pub fn detached() -> Self {
        Self::default()
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Payload events received from Discord"
        );
        describe_counter!(
            "gateway_events_filtered_total",
            Unit::Count,
            "Payload events dropped before publishing"
        );
        describe_counter!(
            "gateway_events_routed_total",
            Unit::Count,
            "Payload events published to NATS"
        );
        describe_counter!(
            "gateway_route_failures_total",
            Unit::Count,
            "Failed publishes to NATS"
        );
        describe_counter!(
            "gateway_lifecycle_events_total",
            Unit::Count,
            "Session lifecycle events"
        );
        describe_counter!("gateway_errors_total", Unit::Count, "Total gateway errors");
        describe_counter!(
            "gateway_status_refreshes_total",
            Unit::Count,
            "Status message refresh attempts"
        );

        describe_histogram!(
            "gateway_event_route_duration_seconds",
            Unit::Seconds,
            "Time to publish an event to NATS"
        );

        describe_gauge!(
            "gateway_shards_ready",
            Unit::Count,
            "Number of shards in ready state"
        );
        describe_gauge!(
            "gateway_nats_connected",
            Unit::Count,
            "NATS connection status (1=connected, 0=disconnected)"
        );
    }

    /// Record a payload event received from a session
    pub fn record_event(&self, shard_id: u32) {
        counter!("gateway_events_received_total", "shard_id" => shard_id.to_string()).increment(1);
    }

    /// Record a payload event dropped before publishing
    pub fn record_filtered(&self, shard_id: u32, reason: &'static str) {
        counter!(
            "gateway_events_filtered_total",
            "shard_id" => shard_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record successful route to NATS
    pub fn record_route_success(&self, shard_id: u32, duration: Duration) {
        counter!("gateway_events_routed_total", "shard_id" => shard_id.to_string()).increment(1);

        histogram!(
            "gateway_event_route_duration_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record failed route
    pub fn record_route_failure(&self, shard_id: u32) {
        counter!("gateway_route_failures_total", "shard_id" => shard_id.to_string()).increment(1);
    }

    /// Record a lifecycle event
    pub fn record_lifecycle(&self, shard_id: u32, kind: LifecycleKind) {
        counter!(
            "gateway_lifecycle_events_total",
            "shard_id" => shard_id.to_string(),
            "kind" => kind.name()
        )
        .increment(1);
    }

    /// Record gateway error with its error type label
    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    /// Record a status message refresh attempt
    pub fn record_status_refresh(&self, outcome: &'static str) {
        counter!("gateway_status_refreshes_total", "outcome" => outcome).increment(1);
    }

    /// Set shards ready count
    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    /// Set NATS connection status
    pub fn set_nats_connected(&self, connected: bool) {
        gauge!("gateway_nats_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
    }
}
