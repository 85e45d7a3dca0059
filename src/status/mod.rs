//! Status reporter
//!
//! Keeps one embed in the status channel up to date with a line per shard:
//! `[<shard>/<total>]: <icon> (<guilds>)`. The reporter wakes every second
//! and refreshes only once the manager's `next_status_due` has passed.
//! Lifecycle events push that deadline out by two seconds, so bursts
//! coalesce into a single refresh; otherwise it repeats every minute.

use crate::error::GatewayError;
use crate::session::{ChannelClient, Embed, SessionInfo};
use crate::shard::sink::LifecycleSink;
use crate::shard::state::{snapshot, ManagerState, SessionState, ShardSnapshot};
use chrono::Utc;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Granularity of the due check
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Steady-state refresh interval
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// How many recent messages are scanned for an existing status message
pub const HISTORY_WINDOW: u16 = 50;

pub const STATUS_COLOR: u32 = 0x4286f4;

/// Guild count for a shard's status line
pub type GuildCounter = Arc<dyn Fn(&SessionInfo) -> u64 + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusIcon {
    /// No live connection
    Down,
    /// Connected or connecting, not ready yet
    Pending,
    Ready,
}

impl StatusIcon {
    pub fn for_session(state: SessionState, ready: bool) -> Self {
        if ready {
            Self::Ready
        } else if state.is_live() {
            Self::Pending
        } else {
            Self::Down
        }
    }

    pub const fn glyph(self) -> &'static str {
        match self {
            Self::Down => "🔥",
            Self::Pending => "🕒",
            Self::Ready => "👌",
        }
    }
}

pub fn status_title(name: &str) -> String {
    if name.is_empty() {
        "Sharding status".to_string()
    } else {
        format!("Sharding status for {name}")
    }
}

pub struct StatusReporter {
    state: Arc<RwLock<ManagerState>>,
    channels: Arc<dyn ChannelClient>,
    channel_id: u64,
    title: String,
    guild_counter: Option<GuildCounter>,
    sink: LifecycleSink,
    message_id: Option<u64>,
}

impl StatusReporter {
    pub fn new(
        state: Arc<RwLock<ManagerState>>,
        channels: Arc<dyn ChannelClient>,
        channel_id: u64,
        name: &str,
        sink: LifecycleSink,
    ) -> Self {
        Self {
            state,
            channels,
            channel_id,
            title: status_title(name),
            guild_counter: None,
            sink,
            message_id: None,
        }
    }

    /// Override how guilds are counted (defaults to the session's cache)
    pub fn with_guild_counter(mut self, counter: Option<GuildCounter>) -> Self {
        self.guild_counter = counter;
        self
    }

    /// Id of the status message once found or created
    pub fn message_id(&self) -> Option<u64> {
        self.message_id
    }

    /// Run until the task is aborted
    pub async fn run(mut self) {
        self.locate_existing().await;

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// Refresh if due; returns whether a refresh was attempted
    pub async fn tick(&mut self) -> bool {
        if !self.claim_due(Instant::now()) {
            return false;
        }
        self.refresh().await;
        true
    }

    fn claim_due(&self, now: Instant) -> bool {
        if !self.state.read().status_due(now) {
            return false;
        }
        self.state.write().claim_status(now, REFRESH_INTERVAL)
    }

    /// Look for a status message this bot left in a previous run.
    ///
    /// Only messages authored by the bot are candidates; when its id cannot
    /// be determined nothing is reused and a fresh message is created.
    pub async fn locate_existing(&mut self) {
        let Some(bot_id) = self.bot_id().await else {
            return;
        };

        match self
            .channels
            .fetch_recent_messages(self.channel_id, HISTORY_WINDOW)
            .await
        {
            Ok(messages) => {
                self.message_id = messages
                    .iter()
                    .filter(|m| m.author_id == bot_id)
                    .find(|m| m.embed_title.as_deref() == Some(self.title.as_str()))
                    .map(|m| m.id);

                match self.message_id {
                    Some(id) => info!(message_id = id, "Reusing status message"),
                    None => debug!(channel_id = self.channel_id, "No previous status message"),
                }
            }
            Err(source) => {
                let err = GatewayError::HistoryScan {
                    channel_id: self.channel_id,
                    source,
                };
                self.sink.handle_error(
                    self.error_shard(),
                    "Failed requesting message history in channel",
                    &err,
                );
            }
        }
    }

    /// Bot user id from a ready session, or from the REST client before any is
    async fn bot_id(&self) -> Option<u64> {
        if let Some(id) = snapshot(&self.state).iter().find_map(|s| s.info.user_id) {
            return Some(id);
        }

        match self.channels.current_user_id().await {
            Ok(id) => Some(id),
            Err(source) => {
                let err = GatewayError::HistoryScan {
                    channel_id: self.channel_id,
                    source,
                };
                self.sink.handle_error(
                    self.error_shard(),
                    "Failed looking up the bot user",
                    &err,
                );
                None
            }
        }
    }

    fn error_shard(&self) -> u32 {
        self.state.read().sessions.keys().next().copied().unwrap_or(0)
    }

    pub fn render(&self) -> Embed {
        let shards = snapshot(&self.state);
        let mut description = String::new();

        for ShardSnapshot { state, info } in &shards {
            let icon = StatusIcon::for_session(*state, info.ready);
            let guilds = match &self.guild_counter {
                Some(counter) => counter(info),
                None => info.guild_count,
            };
            let _ = writeln!(
                description,
                "[{}/{}]: {} ({})",
                info.shard_id + 1,
                info.shard_count,
                icon.glyph(),
                guilds
            );
        }

        let ready = shards.iter().filter(|s| s.info.ready).count();
        self.sink.metrics().set_shards_ready(ready);

        Embed {
            title: Some(self.title.clone()),
            description,
            color: STATUS_COLOR,
            timestamp: Utc::now(),
        }
    }

    async fn refresh(&mut self) {
        let embed = self.render();

        let result = match self.message_id {
            Some(id) => self.channels.edit_message(self.channel_id, id, &embed).await,
            None => match self.channels.send_message(self.channel_id, &embed).await {
                Ok(id) => {
                    info!(message_id = id, "Created status message");
                    self.message_id = Some(id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => self.sink.metrics().record_status_refresh("ok"),
            Err(source) => {
                self.sink.metrics().record_status_refresh("failed");
                self.sink.handle_error(
                    self.error_shard(),
                    "Failed updating status message",
                    &GatewayError::StatusUpdate(source),
                );
            }
        }
    }
}
