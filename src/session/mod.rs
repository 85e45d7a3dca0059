//! Session collaborator abstraction
//!
//! A session is one shard's streaming connection. The manager owns sessions
//! one-directionally: sessions only ever call the [`Handler`] values they
//! were given, parameterized by shard id and event value.

pub mod discord;

#[cfg(test)]
pub(crate) mod fake;

use crate::error::BoxError;
use crate::events::PayloadEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Callback for lifecycle signals, receives the shard id
pub type ShardCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Callback for payload frames
pub type PayloadCallback = Arc<dyn Fn(u32, PayloadEvent) + Send + Sync>;

/// Closed set of callbacks a session can invoke
#[derive(Clone)]
pub enum Handler {
    Connected(ShardCallback),
    Disconnected(ShardCallback),
    Ready(ShardCallback),
    Resumed(ShardCallback),
    Payload(PayloadCallback),
}

impl Handler {
    pub fn on_connected(f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self::Connected(Arc::new(f))
    }

    pub fn on_disconnected(f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self::Disconnected(Arc::new(f))
    }

    pub fn on_ready(f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self::Ready(Arc::new(f))
    }

    pub fn on_resumed(f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        Self::Resumed(Arc::new(f))
    }

    pub fn on_payload(f: impl Fn(u32, PayloadEvent) + Send + Sync + 'static) -> Self {
        Self::Payload(Arc::new(f))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::Disconnected(_) => "disconnected",
            Self::Ready(_) => "ready",
            Self::Resumed(_) => "resumed",
            Self::Payload(_) => "payload",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// Lifecycle signal raised by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Connected,
    Disconnected,
    Ready,
    Resumed,
}

/// Invoke every handler matching `signal`
pub fn dispatch_signal(handlers: &[Handler], shard_id: u32, signal: Signal) {
    for handler in handlers {
        match (handler, signal) {
            (Handler::Connected(f), Signal::Connected)
            | (Handler::Disconnected(f), Signal::Disconnected)
            | (Handler::Ready(f), Signal::Ready)
            | (Handler::Resumed(f), Signal::Resumed) => f(shard_id),
            _ => {}
        }
    }
}

/// Invoke every payload handler with its own copy of the event
pub fn dispatch_payload(handlers: &[Handler], shard_id: u32, event: &PayloadEvent) {
    for handler in handlers {
        if let Handler::Payload(f) = handler {
            f(shard_id, event.clone());
        }
    }
}

/// Read-only connection state of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub shard_id: u32,
    pub shard_count: u32,
    /// Bot user id, known once Ready arrived
    pub user_id: Option<u64>,
    pub ready: bool,
    pub guild_count: u64,
    pub member_count: u64,
}

/// One shard's streaming connection
#[async_trait]
pub trait Session: Send + Sync {
    fn info(&self) -> SessionInfo;

    /// Register a callback; may be called before or after `open`
    fn add_handler(&self, handler: Handler);

    async fn open(&self) -> Result<(), BoxError>;

    async fn close(&self) -> Result<(), BoxError>;
}

/// Builds a session handle per shard
pub trait SessionFactory: Send + Sync {
    fn create(&self, shard_id: u32, shard_count: u32) -> Result<Arc<dyn Session>, BoxError>;
}

impl<F> SessionFactory for F
where
    F: Fn(u32, u32) -> Result<Arc<dyn Session>, BoxError> + Send + Sync,
{
    fn create(&self, shard_id: u32, shard_count: u32) -> Result<Arc<dyn Session>, BoxError> {
        self(shard_id, shard_count)
    }
}

/// Embed sent to a channel (status and log forwarding)
#[derive(Debug, Clone, PartialEq)]
pub struct Embed {
    pub title: Option<String>,
    pub description: String,
    pub color: u32,
    pub timestamp: DateTime<Utc>,
}

/// Message read back from channel history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: u64,
    pub author_id: u64,
    /// Title of the first embed, `None` when there is no titled embed
    pub embed_title: Option<String>,
}

/// Side-effecting channel calls used by the status reporter and log forwarding
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Id of the user the client is authenticated as
    async fn current_user_id(&self) -> Result<u64, BoxError>;

    /// Most recent messages first
    async fn fetch_recent_messages(
        &self,
        channel_id: u64,
        limit: u16,
    ) -> Result<Vec<ChannelMessage>, BoxError>;

    /// Returns the id of the created message
    async fn send_message(&self, channel_id: u64, embed: &Embed) -> Result<u64, BoxError>;

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        embed: &Embed,
    ) -> Result<(), BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn signals_reach_only_matching_handlers() {
        let ready = Arc::new(AtomicU32::new(0));
        let resumed = Arc::new(AtomicU32::new(0));

        let handlers = vec![
            {
                let ready = Arc::clone(&ready);
                Handler::on_ready(move |shard| {
                    ready.fetch_add(shard + 1, Ordering::SeqCst);
                })
            },
            {
                let resumed = Arc::clone(&resumed);
                Handler::on_resumed(move |_| {
                    resumed.fetch_add(1, Ordering::SeqCst);
                })
            },
        ];

        dispatch_signal(&handlers, 4, Signal::Ready);

        assert_eq!(ready.load(Ordering::SeqCst), 5);
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn payload_handlers_get_their_own_copy() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let handlers = vec![
            {
                let seen = Arc::clone(&seen);
                Handler::on_payload(move |shard, event| seen.lock().push((shard, event.kind)))
            },
            Handler::on_connected(|_| panic!("not a payload handler")),
        ];

        dispatch_payload(&handlers, 1, &PayloadEvent::dispatch("GUILD_CREATE", b"{}".to_vec()));

        assert_eq!(*seen.lock(), vec![(1, "GUILD_CREATE".to_string())]);
    }

    #[test]
    fn closures_act_as_factories() {
        let factory = |_: u32, _: u32| -> Result<Arc<dyn Session>, BoxError> { Err("no token".into()) };
        let err = SessionFactory::create(&factory, 0, 1).err().unwrap();
        assert_eq!(err.to_string(), "no token");
    }
}
