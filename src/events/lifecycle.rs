//! Session lifecycle events
//!
//! One `LifecycleEvent` is built per occurrence (connected, ready, closed...)
//! and handed by value to the observer, the log forwarder and the bus.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Kind of lifecycle signal emitted for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleKind {
    /// Connection to the gateway was established
    Connected,
    /// Connection was lost
    Disconnected,
    /// Connection was successfully resumed
    Resumed,
    /// Ready payload received
    Ready,
    /// The manager opened the session
    Opened,
    /// The manager closed the session
    Closed,
    /// Something downstream of the session failed
    Error,
}

impl LifecycleKind {
    pub const ALL: [LifecycleKind; 7] = [
        Self::Connected,
        Self::Disconnected,
        Self::Resumed,
        Self::Ready,
        Self::Opened,
        Self::Closed,
        Self::Error,
    ];

    /// Lowercase name, also used as metrics label
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Resumed => "resumed",
            Self::Ready => "ready",
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }

    /// Title-cased name for human-readable output
    pub const fn title(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Resumed => "Resumed",
            Self::Ready => "Ready",
            Self::Opened => "Opened",
            Self::Closed => "Closed",
            Self::Error => "Error",
        }
    }

    /// Embed color used when forwarding to the log channel
    pub const fn color(self) -> u32 {
        match self {
            Self::Opened => 0xec58fc,
            Self::Closed => 0xff7621,
            Self::Connected => 0x54d646,
            Self::Disconnected => 0xcc2424,
            Self::Resumed => 0x5985ff,
            Self::Ready => 0x00ffbf,
            Self::Error => 0x7a1bad,
        }
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single lifecycle occurrence on one shard
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    /// Internal 0-based shard id
    pub shard_id: u32,
    pub shard_count: u32,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Bus representation of a lifecycle event (shard is 1-based)
#[derive(Debug, Serialize)]
pub struct LifecycleMessage<'a> {
    #[serde(rename = "type")]
    pub kind: LifecycleKind,
    pub shard: u32,
    #[serde(rename = "numShards")]
    pub num_shards: u32,
    pub message: &'a str,
    pub time: DateTime<Utc>,
}

impl LifecycleEvent {
    pub fn new(
        kind: LifecycleKind,
        shard_id: u32,
        shard_count: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            shard_id,
            shard_count,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn to_message(&self) -> LifecycleMessage<'_> {
        LifecycleMessage {
            kind: self.kind,
            shard: self.shard_id + 1,
            num_shards: self.shard_count,
            message: &self.message,
            time: self.time,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Discord [{}/{}] {}",
            self.shard_id + 1,
            self.shard_count,
            self.kind.title()
        )?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_one_based_shard() {
        let event = LifecycleEvent::new(LifecycleKind::Ready, 0, 4, "");
        assert_eq!(event.to_string(), "Discord [1/4] Ready");
    }

    #[test]
    fn display_appends_message() {
        let event = LifecycleEvent::new(LifecycleKind::Error, 2, 4, "Failed updating status message");
        assert_eq!(
            event.to_string(),
            "Discord [3/4] Error: Failed updating status message"
        );
    }

    #[test]
    fn every_kind_has_a_distinct_color() {
        let mut colors: Vec<_> = LifecycleKind::ALL.iter().map(|k| k.color()).collect();
        colors.sort_unstable();
        colors.dedup();
        assert_eq!(colors.len(), LifecycleKind::ALL.len());
    }

    #[test]
    fn bus_message_shape() {
        let event = LifecycleEvent::new(LifecycleKind::Disconnected, 1, 2, "");
        let json = serde_json::to_value(event.to_message()).unwrap();

        assert_eq!(json["type"], "disconnected");
        assert_eq!(json["shard"], 2);
        assert_eq!(json["numShards"], 2);
        assert!(json["time"].is_string());
    }
}
