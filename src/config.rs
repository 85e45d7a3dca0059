//! Gateway configuration
//!
//! Loaded from `GATEWAY_`-prefixed environment variables (an optional `.env`
//! file is honoured) and validated before anything connects.

use crate::error::GatewayError;
use crate::events::EventFilter;
use crate::nats::subjects;
use crate::shard::ManagerSettings;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use twilight_gateway::Intents;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Bot token; `DISCORD_TOKEN` is used when the prefixed key is unset
    #[serde(default)]
    pub discord_token: String,

    /// First shard id managed by this process
    #[serde(default)]
    pub shard_offset: u64,

    /// Shards managed by this process, the rest of the space when unset
    pub shard_count: Option<u64>,

    /// Shards across every process of the bot
    #[serde(default = "default_total_shards")]
    pub total_shards: u64,

    /// Display name for the status title and forwarded log lines
    #[serde(default)]
    pub name: String,

    pub log_channel: Option<u64>,
    pub status_channel: Option<u64>,

    /// NATS server URL(s), comma-separated; local mode when unset
    pub nats_url: Option<String>,

    #[serde(default = "default_event_subject")]
    pub event_subject: String,

    #[serde(default = "default_lifecycle_subject")]
    pub lifecycle_subject: String,

    /// Comma-separated event types to forward (exclusive with `event_deny`)
    pub event_allow: Option<String>,

    /// Comma-separated event types to drop
    pub event_deny: Option<String>,

    #[serde(default = "default_stagger_secs")]
    pub stagger_secs: u64,

    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,

    /// Health/metrics HTTP port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_total_shards() -> u64 {
    1
}

fn default_event_subject() -> String {
    subjects::EVENTS.to_string()
}

fn default_lifecycle_subject() -> String {
    subjects::LIFECYCLE.to_string()
}

fn default_stagger_secs() -> u64 {
    5
}

fn default_close_timeout_secs() -> u64 {
    10
}

fn default_http_port() -> u16 {
    9090
}

fn default_log_level() -> String {
    "info".to_string()
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn shard_u32(value: u64) -> Result<u32, GatewayError> {
    u32::try_from(value).map_err(|_| GatewayError::ShardIdOverflow { value })
}

impl GatewayConfig {
    /// Load and validate configuration from the environment
    pub fn load() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let mut config: Self = config::Config::builder()
            .add_source(config::Environment::with_prefix("GATEWAY").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        if config.discord_token.is_empty() {
            config.discord_token = env::var("DISCORD_TOKEN").unwrap_or_default();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.discord_token.trim().is_empty() {
            return Err(GatewayError::Config(
                "GATEWAY_DISCORD_TOKEN or DISCORD_TOKEN must be set".to_string(),
            ));
        }
        if self.total_shards == 0 {
            return Err(GatewayError::Config(
                "GATEWAY_TOTAL_SHARDS must be at least 1".to_string(),
            ));
        }

        let count = self
            .shard_count
            .unwrap_or_else(|| self.total_shards.saturating_sub(self.shard_offset));
        if self.shard_offset.saturating_add(count) > self.total_shards {
            return Err(GatewayError::Config(format!(
                "shards {}..{} exceed total of {}",
                self.shard_offset,
                self.shard_offset.saturating_add(count),
                self.total_shards
            )));
        }
        if count == 0 {
            return Err(GatewayError::Config(
                "no shards left to manage for this process".to_string(),
            ));
        }

        self.event_filter()?;
        self.manager_settings()?;
        Ok(())
    }

    /// Token without a leading `Bot ` (the Discord clients add it themselves)
    pub fn bot_token(&self) -> &str {
        let token = self.discord_token.trim();
        token.strip_prefix("Bot ").unwrap_or(token)
    }

    pub fn event_filter(&self) -> Result<EventFilter, GatewayError> {
        EventFilter::from_lists(
            split_list(self.event_allow.as_deref()),
            split_list(self.event_deny.as_deref()),
        )
    }

    pub fn manager_settings(&self) -> Result<ManagerSettings, GatewayError> {
        Ok(ManagerSettings {
            name: self.name.clone(),
            shard_offset: shard_u32(self.shard_offset)?,
            shard_count: self.shard_count.map(shard_u32).transpose()?,
            total_shards: shard_u32(self.total_shards)?,
            stagger: Duration::from_secs(self.stagger_secs),
            close_timeout: Duration::from_secs(self.close_timeout_secs),
            log_channel: self.log_channel,
            status_channel: self.status_channel,
        })
    }

    /// Gateway intents.
    ///
    /// GUILDS keeps the cached guild set current for the status message,
    /// GUILD_MEMBERS is needed for member events. Message content stays off.
    pub fn intents() -> Intents {
        Intents::GUILDS | Intents::GUILD_MEMBERS
    }
}
