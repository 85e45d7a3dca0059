//! Shard manager state
//!
//! Everything the manager mutates lives in [`ManagerState`], guarded by a
//! single reader-writer lock owned by the manager. Guards are never held
//! across I/O: callers copy what they need and release.

use crate::events::LifecycleKind;
use crate::session::{Handler, Session, SessionInfo};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Connection state of one shard's session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    /// Handle built and handlers registered
    Initialized,
    Opening,
    Open,
    Disconnected,
    Resumed,
    /// Terminal, reached only through shutdown
    Closed,
}

impl SessionState {
    /// State after a lifecycle signal; errors never change state
    pub fn on_event(self, kind: LifecycleKind) -> Self {
        use LifecycleKind as K;

        match (self, kind) {
            (Self::Closed, _) | (_, K::Error) => self,
            (_, K::Closed) => Self::Closed,
            // No connection exists before the manager starts opening
            (Self::Uninitialized | Self::Initialized, _) => self,
            (_, K::Opened | K::Connected | K::Ready) => Self::Open,
            (_, K::Disconnected) => Self::Disconnected,
            (_, K::Resumed) => Self::Resumed,
        }
    }

    /// Whether a live (or reconnecting) connection is expected
    pub fn is_live(self) -> bool {
        matches!(self, Self::Opening | Self::Open | Self::Resumed | Self::Disconnected)
    }
}

/// One shard's session and its bookkeeping
#[derive(Clone)]
pub struct SessionRecord {
    pub shard_id: u32,
    pub shard_count: u32,
    pub state: SessionState,
    pub handle: Arc<dyn Session>,
}

impl SessionRecord {
    pub fn new(shard_id: u32, shard_count: u32, handle: Arc<dyn Session>) -> Self {
        Self {
            shard_id,
            shard_count,
            state: SessionState::Initialized,
            handle,
        }
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("shard_id", &self.shard_id)
            .field("shard_count", &self.shard_count)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Per-shard view used by status rendering and health checks
#[derive(Debug, Clone)]
pub struct ShardSnapshot {
    pub state: SessionState,
    pub info: SessionInfo,
}

/// Snapshot every shard in id order. Session info is read after the guard
/// is released.
pub fn snapshot(state: &RwLock<ManagerState>) -> Vec<ShardSnapshot> {
    let records: Vec<_> = state
        .read()
        .sessions
        .values()
        .map(|r| (r.state, Arc::clone(&r.handle)))
        .collect();

    records
        .into_iter()
        .map(|(state, handle)| ShardSnapshot {
            state,
            info: handle.info(),
        })
        .collect()
}

/// Mutable manager state, one synchronization domain
#[derive(Debug)]
pub struct ManagerState {
    /// Keyed by shard id; the key set is fixed once init completes
    pub sessions: BTreeMap<u32, SessionRecord>,
    pub initialized: bool,
    pub started: bool,
    /// Handlers applied to every session, in registration order
    pub handlers: Vec<Handler>,
    /// When the status message is next due for a refresh
    pub next_status_due: Instant,
    pub status_task: Option<JoinHandle<()>>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            sessions: BTreeMap::new(),
            initialized: false,
            started: false,
            handlers: Vec::new(),
            next_status_due: Instant::now(),
            status_task: None,
        }
    }
}

impl ManagerState {
    /// Install the sessions built by init
    pub fn install(&mut self, sessions: BTreeMap<u32, SessionRecord>, now: Instant) {
        self.sessions = sessions;
        self.initialized = true;
        self.next_status_due = now;
    }

    /// Push the status refresh to `now + delay`, coalescing bursts
    pub fn defer_status(&mut self, now: Instant, delay: Duration) {
        self.next_status_due = now + delay;
    }

    pub fn status_due(&self, now: Instant) -> bool {
        now >= self.next_status_due
    }

    /// Claim a due refresh and schedule the next one `interval` later
    pub fn claim_status(&mut self, now: Instant, interval: Duration) -> bool {
        if !self.status_due(now) {
            return false;
        }
        self.next_status_due = now + interval;
        true
    }

    /// Session handles in shard order
    pub fn handles(&self) -> Vec<(u32, Arc<dyn Session>)> {
        self.sessions
            .iter()
            .map(|(id, record)| (*id, Arc::clone(&record.handle)))
            .collect()
    }

    pub fn set_state(&mut self, shard_id: u32, state: SessionState) {
        if let Some(record) = self.sessions.get_mut(&shard_id) {
            record.state = state;
        }
    }
}
