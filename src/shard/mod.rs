//! Shard management module
//!
//! The manager owns every session of this process, the sink turns session
//! signals into lifecycle events, and the state module holds what they share.

pub mod manager;
pub mod sink;
pub mod state;

pub use manager::{ManagerSettings, ShardManager, CLOSE_TIMEOUT, STAGGER_INTERVAL};
pub use sink::{BusTarget, EventObserver, LifecycleSink, LogForwarder, STATUS_DEBOUNCE};
pub use state::{ManagerState, SessionRecord, SessionState, ShardSnapshot};
