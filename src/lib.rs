//! Shardcast Gateway
//!
//! Multi-shard Discord gateway built on Twilight:
//! - Opens a contiguous range of shards with a staggered start
//! - Publishes dispatch events and session lifecycle events to NATS
//! - Keeps a per-shard status message current in a Discord channel
//! - Exposes health/ready endpoints and Prometheus metrics

pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod session;
pub mod shard;
pub mod status;

pub use error::{BoxError, GatewayError};
pub use shard::{ManagerSettings, ShardManager};
