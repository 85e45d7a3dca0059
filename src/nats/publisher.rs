//! NATS event publisher
//!
//! Core (non-JetStream) publish: the gateway never waits for acks and never
//! buffers. Persistence is the bus's concern.

use crate::error::GatewayError;
use async_nats::connection::State;
use async_nats::Client;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default subjects
pub mod subjects {
    /// Gateway payload fan-out
    pub const EVENTS: &str = "gateway.exchange";
    /// Session lifecycle events
    pub const LIFECYCLE: &str = "gateway.lifecycle";
}

/// Bus publish capability
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), GatewayError>;
}

/// NATS publisher for gateway envelopes
pub struct NatsPublisher {
    client: Client,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsPublisher {
    /// Connect to NATS server(s), `servers` may be comma-separated
    pub async fn connect(servers: &str, name: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, name, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .name(name)
            .connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;

        Ok(Arc::new(Self {
            client,
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    /// Get total messages published
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Get total publish failures
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Flush pending messages before shutdown
    pub async fn close(&self) {
        info!(
            published = self.messages_published(),
            failures = self.publish_failures(),
            "Closing NATS connection"
        );
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
    }
}

#[async_trait]
impl Publisher for NatsPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        match self.client.publish(subject.to_string(), payload.into()).await {
            Ok(()) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(subject, "Message published");
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                Err(GatewayError::PublishFailed {
                    subject: subject.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}
