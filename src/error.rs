//! Domain error types for the shard gateway
//!
//! Structured thiserror types so every failure carries the shard or subject
//! it happened on.
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, GatewayError>.

use std::fmt;
use thiserror::Error;

/// Opaque error produced by an external collaborator (session, REST client, bus)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A close failure attributed to one shard
#[derive(Debug)]
pub struct ShardFailure {
    pub shard_id: u32,
    pub source: BoxError,
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {}: {}", self.shard_id, self.source)
    }
}

/// Gateway domain errors
///
/// Only session creation and session open failures are fatal. Everything
/// downstream of a live session (publishing, status, log forwarding) is
/// contained where it happens and surfaces here only for logging.
///
/// Example log output:
/// ```text
/// GatewayError::SessionOpen { shard_id: 3, .. }
/// → "failed to open session for shard 3"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Session factory refused to build a handle (fatal, aborts init)
    #[error("failed to create session for shard {shard_id}")]
    SessionInit {
        shard_id: u32,
        #[source]
        source: BoxError,
    },

    /// Session failed to open (fatal, remaining shards are not opened)
    #[error("failed to open session for shard {shard_id}")]
    SessionOpen {
        shard_id: u32,
        #[source]
        source: BoxError,
    },

    /// One or more sessions failed to close during shutdown
    #[error("failed to close {} session(s): {}", .failures.len(), join_failures(.failures))]
    SessionClose { failures: Vec<ShardFailure> },

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    PublishFailed {
        subject: String,
        #[source]
        source: BoxError,
    },

    /// A shard's publish lane is full, the message was dropped
    #[error("publish backlog full for shard {shard_id} on subject '{subject}'")]
    PublishBacklog { shard_id: u32, subject: String },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] BoxError),

    /// Creating or editing the status message failed
    #[error("status message update failed")]
    StatusUpdate(#[source] BoxError),

    /// Reading the status channel history failed
    #[error("failed to scan history of channel {channel_id}")]
    HistoryScan {
        channel_id: u64,
        #[source]
        source: BoxError,
    },

    /// Forwarding a lifecycle event to the log channel failed
    #[error("failed to forward event to channel {channel_id}")]
    LogForward {
        channel_id: u64,
        #[source]
        source: BoxError,
    },

    /// Raw payload bytes could not be decoded
    #[error("failed to decode {event_type} payload")]
    Decode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// Envelope serialization failed
    #[error("event serialization failed for {event_type} on shard {shard_id}")]
    SerializationFailed {
        event_type: String,
        shard_id: u32,
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Shard ID overflow: u64 value exceeds u32::MAX (Twilight API boundary)
    #[error("shard ID overflow: {value} exceeds u32::MAX")]
    ShardIdOverflow { value: u64 },

    /// Prometheus recorder could not be installed
    #[error("failed to install metrics recorder: {0}")]
    MetricsInstall(String),
}

fn join_failures(failures: &[ShardFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::SessionInit { .. } => "session_init",
            Self::SessionOpen { .. } => "session_open",
            Self::SessionClose { .. } => "session_close",
            Self::PublishFailed { .. } => "nats_publish",
            Self::PublishBacklog { .. } => "publish_backlog",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::StatusUpdate(_) => "status_update",
            Self::HistoryScan { .. } => "history_scan",
            Self::LogForward { .. } => "log_forward",
            Self::Decode { .. } => "decode",
            Self::SerializationFailed { .. } => "serialization",
            Self::Config(_) => "config",
            Self::ShardIdOverflow { .. } => "shard_overflow",
            Self::MetricsInstall(_) => "metrics_install",
        }
    }

    /// Whether the process should stop because of this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionInit { .. }
                | Self::SessionOpen { .. }
                | Self::Config(_)
                | Self::ShardIdOverflow { .. }
                | Self::MetricsInstall(_)
        )
    }
}
