//! Payload event routing
//!
//! Filters dispatch frames and publishes accepted ones as envelopes. Publish
//! is fire-and-forget: envelopes go onto their shard's publish lane, so one
//! shard's events reach the bus in order. Failures are logged and counted,
//! nothing is retried.

use crate::error::GatewayError;
use crate::events::envelope::{OutboundEnvelope, PayloadEvent};
use crate::events::filter::EventFilter;
use crate::metrics::GatewayMetrics;
use crate::nats::{PublishLanes, PublishReport, Publisher};
use crate::session::Handler;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct EventRouter {
    lanes: Option<PublishLanes>,
    subject: String,
    filter: EventFilter,
    metrics: GatewayMetrics,
}

impl EventRouter {
    /// `publisher: None` runs in local mode: envelopes are logged and dropped
    pub fn new(
        publisher: Option<Arc<dyn Publisher>>,
        subject: impl Into<String>,
        filter: EventFilter,
        metrics: GatewayMetrics,
    ) -> Self {
        let lanes = publisher.map(|publisher| {
            let metrics = metrics.clone();
            let report: PublishReport = Arc::new(
                move |shard_id: u32, subject: &str, result: Result<Duration, GatewayError>| match result {
                    Ok(elapsed) => metrics.record_route_success(shard_id, elapsed),
                    Err(e) => {
                        metrics.record_route_failure(shard_id);
                        warn!(shard_id, subject, error = %e, "Failed to publish event to NATS");
                    }
                },
            );
            PublishLanes::new(publisher, report)
        });

        Self {
            lanes,
            subject: subject.into(),
            filter,
            metrics,
        }
    }

    /// Payload handler to register on a session of a `shard_count` deployment
    pub fn handler(self: &Arc<Self>, shard_count: u32) -> Handler {
        let router = Arc::clone(self);
        Handler::on_payload(move |shard_id, event| router.route(shard_id, shard_count, event))
    }

    /// Apply filtering and payload decoding; `None` means the event is dropped
    pub fn accept(
        &self,
        shard_id: u32,
        shard_count: u32,
        event: PayloadEvent,
    ) -> Option<OutboundEnvelope> {
        if !event.is_dispatch() {
            return None;
        }

        self.metrics.record_event(shard_id);

        if !self.filter.permits(&event.kind) {
            self.metrics.record_filtered(shard_id, "policy");
            return None;
        }

        let data = match event.data {
            Some(data) => Some(data),
            None => match serde_json::from_slice(&event.raw) {
                Ok(data) => Some(data),
                Err(source) => {
                    let err = GatewayError::Decode {
                        event_type: event.kind.clone(),
                        source,
                    };
                    self.metrics.record_error(shard_id, err.error_type_label());
                    warn!(shard_id, error = %err, "Forwarding event without payload");
                    None
                }
            },
        };

        Some(OutboundEnvelope::new(event.kind, shard_id, shard_count, data))
    }

    /// Accept and publish without waiting on the bus
    pub fn route(&self, shard_id: u32, shard_count: u32, event: PayloadEvent) {
        let Some(envelope) = self.accept(shard_id, shard_count, event) else {
            return;
        };

        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(source) => {
                let err = GatewayError::SerializationFailed {
                    event_type: envelope.event_type,
                    shard_id,
                    source,
                };
                self.metrics.record_error(shard_id, err.error_type_label());
                warn!(shard_id, error = %err, "Dropping event");
                return;
            }
        };

        let Some(lanes) = &self.lanes else {
            debug!(shard_id, event_type = %envelope.event_type, "No bus configured, dropping event");
            return;
        };

        if let Err(e) = lanes.enqueue(shard_id, &self.subject, payload) {
            self.metrics.record_route_failure(shard_id);
            warn!(shard_id, error = %e, "Dropping event");
        }
    }
}
