//! Twilight-backed sessions
//!
//! Each [`DiscordSession`] drives one `twilight_gateway::Shard` in its own
//! task. Twilight owns heartbeats, identify and resume; this module turns
//! the frames it yields into lifecycle signals and payload events, and keeps
//! the small cache (readiness, bot id, guild set) the status line reads.

use super::{
    dispatch_payload, dispatch_signal, ChannelClient, ChannelMessage, Embed, Handler, Session,
    SessionFactory, SessionInfo, Signal,
};
use crate::error::BoxError;
use crate::events::PayloadEvent;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use twilight_gateway::{CloseFrame, Config, EventTypeFlags, Intents, Message, Shard};
use twilight_http::Client;
use twilight_model::channel::message::Embed as DiscordEmbed;
use twilight_model::gateway::event::Event;
use twilight_model::gateway::payload::incoming::GuildCreate;
use twilight_model::gateway::ShardId;
use twilight_model::id::marker::{ChannelMarker, MessageMarker};
use twilight_model::id::Id;
use twilight_model::util::Timestamp;

/// How long `open` waits for the first gateway frame
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a closing shard may take to acknowledge the close frame
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const HELLO_OPCODE: u8 = 10;

/// Events the session parses for its own bookkeeping
const TRACKED_EVENTS: EventTypeFlags = EventTypeFlags::READY
    .union(EventTypeFlags::RESUMED)
    .union(EventTypeFlags::GUILD_CREATE)
    .union(EventTypeFlags::GUILD_DELETE);

/// Install ring as the process-wide rustls provider.
///
/// The gateway and REST clients both build TLS configs from the process
/// default, and rustls refuses to guess when more than one backend is linked.
/// Safe to call repeatedly.
pub fn install_crypto_provider() {
    // Err only means a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Builds a [`DiscordSession`] per shard sharing one token and intent set
pub struct DiscordSessionFactory {
    token: String,
    intents: Intents,
    open_timeout: Duration,
}

impl DiscordSessionFactory {
    pub fn new(token: String, intents: Intents) -> Self {
        install_crypto_provider();
        Self {
            token,
            intents,
            open_timeout: OPEN_TIMEOUT,
        }
    }
}

impl SessionFactory for DiscordSessionFactory {
    fn create(&self, shard_id: u32, shard_count: u32) -> Result<Arc<dyn Session>, BoxError> {
        let id = ShardId::new_checked(shard_id, shard_count)
            .ok_or_else(|| format!("shard {shard_id} is outside a total of {shard_count}"))?;
        let config = Config::new(self.token.clone(), self.intents);

        Ok(Arc::new(DiscordSession::new(id, config, self.open_timeout)))
    }
}

/// State shared between the session handle and its shard task
#[derive(Default)]
struct SessionCache {
    ready: AtomicBool,
    user_id: AtomicU64,
    /// guild id → member count
    guilds: Mutex<HashMap<u64, u64>>,
}

impl SessionCache {
    fn on_ready(&self, user_id: u64, guild_ids: impl Iterator<Item = u64>) {
        self.user_id.store(user_id, Ordering::Relaxed);
        let mut guilds = self.guilds.lock();
        guilds.clear();
        guilds.extend(guild_ids.map(|id| (id, 0)));
        self.ready.store(true, Ordering::Release);
    }
}

struct Runner {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One Discord gateway shard
pub struct DiscordSession {
    id: ShardId,
    config: Config,
    open_timeout: Duration,
    handlers: Arc<RwLock<Vec<Handler>>>,
    cache: Arc<SessionCache>,
    runner: Mutex<Option<Runner>>,
}

impl DiscordSession {
    pub fn new(id: ShardId, config: Config, open_timeout: Duration) -> Self {
        Self {
            id,
            config,
            open_timeout,
            handlers: Arc::default(),
            cache: Arc::default(),
            runner: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Session for DiscordSession {
    fn info(&self) -> SessionInfo {
        let user_id = self.cache.user_id.load(Ordering::Relaxed);
        let guilds = self.cache.guilds.lock();
        SessionInfo {
            shard_id: self.id.number(),
            shard_count: self.id.total(),
            user_id: (user_id != 0).then_some(user_id),
            ready: self.cache.ready.load(Ordering::Acquire),
            guild_count: guilds.len() as u64,
            member_count: guilds.values().sum(),
        }
    }

    fn add_handler(&self, handler: Handler) {
        self.handlers.write().push(handler);
    }

    async fn open(&self) -> Result<(), BoxError> {
        let (first_tx, first_rx) = oneshot::channel();
        {
            let mut runner = self.runner.lock();
            if runner.is_some() {
                return Err("session is already open".into());
            }

            let (stop_tx, stop_rx) = oneshot::channel();
            let shard = Shard::with_config(self.id, self.config.clone());
            let task = tokio::spawn(run_shard(
                shard,
                Arc::clone(&self.handlers),
                Arc::clone(&self.cache),
                first_tx,
                stop_rx,
            ));
            *runner = Some(Runner { stop: stop_tx, task });
        }

        match tokio::time::timeout(self.open_timeout, first_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err("shard task ended before the gateway answered".into()),
            Err(_) => Err(format!("no gateway frame within {:?}", self.open_timeout).into()),
        }
    }

    async fn close(&self) -> Result<(), BoxError> {
        let runner = self.runner.lock().take();
        let Some(runner) = runner else {
            return Ok(());
        };

        // The task may already have ended on its own
        let _ = runner.stop.send(());
        runner.task.await?;
        self.cache.ready.store(false, Ordering::Release);
        Ok(())
    }
}

/// Gateway frame header; `d` stays raw for the router
#[derive(Deserialize)]
struct RawFrame<'a> {
    op: u8,
    #[serde(default)]
    t: Option<String>,
    #[serde(borrow, default)]
    d: Option<&'a RawValue>,
}

/// Drive a shard until it is stopped or its stream ends
async fn run_shard(
    mut shard: Shard,
    handlers: Arc<RwLock<Vec<Handler>>>,
    cache: Arc<SessionCache>,
    first_tx: oneshot::Sender<Result<(), BoxError>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let shard_id = shard.id().number();
    let mut first = Some(first_tx);

    loop {
        let item = tokio::select! {
            item = shard.next() => item,
            _ = &mut stop_rx => {
                shard.close(CloseFrame::NORMAL);
                drain(&mut shard).await;
                break;
            }
        };

        match item {
            None => {
                info!(shard_id, "Shard message stream ended");
                break;
            }
            Some(Err(source)) => {
                warn!(shard_id, error = %source, "Error receiving gateway message");
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(Box::new(source)));
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(shard_id, ?frame, "Gateway closed the connection");
                cache.ready.store(false, Ordering::Release);
                let handlers = handlers.read().clone();
                dispatch_signal(&handlers, shard_id, Signal::Disconnected);
            }
            Some(Ok(Message::Text(json))) => {
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(()));
                }
                handle_text(shard_id, json, &handlers, &cache);
            }
        }
    }
}

/// Wait for the close handshake so the session is not resumed by mistake
async fn drain(shard: &mut Shard) {
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(item) = shard.next().await {
            if matches!(item, Ok(Message::Close(_))) {
                break;
            }
        }
    })
    .await;
}

fn handle_text(
    shard_id: u32,
    json: String,
    handlers: &RwLock<Vec<Handler>>,
    cache: &SessionCache,
) {
    let payload = match serde_json::from_str::<RawFrame<'_>>(&json) {
        Ok(frame) => PayloadEvent {
            op: frame.op,
            kind: frame.t.unwrap_or_default(),
            raw: frame.d.map(|d| d.get().as_bytes().to_vec()).unwrap_or_default(),
            data: None,
        },
        Err(e) => {
            warn!(shard_id, error = %e, "Unreadable gateway frame");
            return;
        }
    };

    let mut signal = (payload.op == HELLO_OPCODE).then_some(Signal::Connected);

    match twilight_gateway::parse(json, TRACKED_EVENTS) {
        Ok(Some(event)) => match Event::from(event) {
            Event::Ready(ready) => {
                cache.on_ready(
                    ready.user.id.get(),
                    ready.guilds.iter().map(|g| g.id.get()),
                );
                info!(shard_id, guilds = ready.guilds.len(), "Shard ready");
                signal = Some(Signal::Ready);
            }
            Event::Resumed => {
                cache.ready.store(true, Ordering::Release);
                signal = Some(Signal::Resumed);
            }
            Event::GuildCreate(guild) => {
                cache.guilds.lock().insert(guild.id().get(), member_count(&guild));
            }
            Event::GuildDelete(guild) => {
                // Unavailable guilds stay cached, they come back after an outage
                if guild.unavailable != Some(true) {
                    cache.guilds.lock().remove(&guild.id.get());
                }
            }
            _ => {}
        },
        Ok(None) => {}
        Err(e) => debug!(shard_id, error = %e, "Gateway frame not parsed"),
    }

    let handlers = handlers.read().clone();
    if let Some(signal) = signal {
        dispatch_signal(&handlers, shard_id, signal);
    }
    dispatch_payload(&handlers, shard_id, &payload);
}

fn member_count(guild: &GuildCreate) -> u64 {
    match guild {
        GuildCreate::Available(guild) => guild.member_count.unwrap_or(0),
        GuildCreate::Unavailable(_) => 0,
    }
}

/// Discord REST client for status and log channels
pub struct DiscordRest {
    http: Arc<Client>,
}

impl DiscordRest {
    /// Call [`install_crypto_provider`] before building `http`
    pub fn new(http: Arc<Client>) -> Self {
        Self { http }
    }
}

fn channel_id(id: u64) -> Result<Id<ChannelMarker>, BoxError> {
    Id::new_checked(id).ok_or_else(|| "channel id must be non-zero".into())
}

fn message_id(id: u64) -> Result<Id<MessageMarker>, BoxError> {
    Id::new_checked(id).ok_or_else(|| "message id must be non-zero".into())
}

fn to_discord_embed(embed: &Embed) -> DiscordEmbed {
    DiscordEmbed {
        author: None,
        color: Some(embed.color),
        description: Some(embed.description.clone()),
        fields: Vec::new(),
        footer: None,
        image: None,
        kind: "rich".to_string(),
        provider: None,
        thumbnail: None,
        timestamp: Timestamp::from_secs(embed.timestamp.timestamp()).ok(),
        title: embed.title.clone(),
        url: None,
        video: None,
    }
}

#[async_trait]
impl ChannelClient for DiscordRest {
    async fn current_user_id(&self) -> Result<u64, BoxError> {
        let user = self.http.current_user().await?.model().await?;
        Ok(user.id.get())
    }

    async fn fetch_recent_messages(
        &self,
        channel: u64,
        limit: u16,
    ) -> Result<Vec<ChannelMessage>, BoxError> {
        let messages = self
            .http
            .channel_messages(channel_id(channel)?)
            .limit(limit)
            .await?
            .models()
            .await?;

        Ok(messages
            .into_iter()
            .map(|m| ChannelMessage {
                id: m.id.get(),
                author_id: m.author.id.get(),
                embed_title: m.embeds.first().and_then(|e| e.title.clone()),
            })
            .collect())
    }

    async fn send_message(&self, channel: u64, embed: &Embed) -> Result<u64, BoxError> {
        let embeds = [to_discord_embed(embed)];
        let message = self
            .http
            .create_message(channel_id(channel)?)
            .embeds(&embeds)
            .await?
            .model()
            .await?;

        Ok(message.id.get())
    }

    async fn edit_message(&self, channel: u64, message: u64, embed: &Embed) -> Result<(), BoxError> {
        let embeds = [to_discord_embed(embed)];
        self.http
            .update_message(channel_id(channel)?, message_id(message)?)
            .embeds(Some(embeds.as_slice()))
            .await?;

        Ok(())
    }
}
