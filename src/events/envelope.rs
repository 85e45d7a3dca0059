//! Payload events and the envelope published to the bus
//!
//! Wire shape: `{type, shard (1-based), numShards, data, time (RFC3339)}`.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Gateway opcode carried by dispatch frames
pub const DISPATCH_OPCODE: u8 = 0;

/// A raw frame delivered by a session to its payload handlers
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadEvent {
    /// Gateway opcode, only dispatches (0) carry event data
    pub op: u8,
    /// Dispatch type name, e.g. `MESSAGE_CREATE`; empty for non-dispatch frames
    pub kind: String,
    /// Raw JSON bytes of the frame's `d` field
    pub raw: Vec<u8>,
    /// Structured payload when the session already decoded it
    pub data: Option<serde_json::Value>,
}

impl PayloadEvent {
    pub fn dispatch(kind: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            op: DISPATCH_OPCODE,
            kind: kind.into(),
            raw: raw.into(),
            data: None,
        }
    }

    /// Whether the frame carries a usable dispatch payload
    pub fn is_dispatch(&self) -> bool {
        self.op == DISPATCH_OPCODE && !self.kind.is_empty()
    }
}

/// Envelope published for each accepted payload event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    /// 1-based shard number for external consumers
    pub shard: u32,
    #[serde(rename = "numShards")]
    pub num_shards: u32,
    pub data: Option<serde_json::Value>,
    pub time: DateTime<Utc>,
}

impl OutboundEnvelope {
    /// Build an envelope from an internal 0-based shard id
    pub fn new(
        event_type: impl Into<String>,
        shard_id: u32,
        num_shards: u32,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            shard: shard_id + 1,
            num_shards,
            data,
            time: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
