//! In-memory session and channel doubles for tests

use super::{
    dispatch_payload, dispatch_signal, ChannelClient, ChannelMessage, Embed, Handler, Session,
    SessionFactory, SessionInfo, Signal,
};
use crate::error::BoxError;
use crate::events::PayloadEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A recorded open/close call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Call {
    pub(crate) op: &'static str,
    pub(crate) shard_id: u32,
    pub(crate) at: Instant,
}

pub(crate) type CallLog = Arc<Mutex<Vec<Call>>>;

pub(crate) struct FakeSession {
    shard_id: u32,
    shard_count: u32,
    handlers: Mutex<Vec<Handler>>,
    info: Mutex<SessionInfo>,
    log: CallLog,
    fail_open: bool,
    fail_close: bool,
    hang_close: bool,
}

impl FakeSession {
    pub(crate) fn new(shard_id: u32, shard_count: u32) -> Self {
        Self {
            shard_id,
            shard_count,
            handlers: Mutex::new(Vec::new()),
            info: Mutex::new(SessionInfo {
                shard_id,
                shard_count,
                ..SessionInfo::default()
            }),
            log: CallLog::default(),
            fail_open: false,
            fail_close: false,
            hang_close: false,
        }
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub(crate) fn fire(&self, signal: Signal) {
        let handlers = self.handlers.lock().clone();
        dispatch_signal(&handlers, self.shard_id, signal);
    }

    pub(crate) fn fire_payload(&self, event: PayloadEvent) {
        let handlers = self.handlers.lock().clone();
        dispatch_payload(&handlers, self.shard_id, &event);
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.info.lock().ready = ready;
    }

    pub(crate) fn set_guilds(&self, count: u64) {
        self.info.lock().guild_count = count;
    }

    pub(crate) fn set_user(&self, user_id: u64) {
        self.info.lock().user_id = Some(user_id);
    }

    fn record(&self, op: &'static str) {
        self.log.lock().push(Call {
            op,
            shard_id: self.shard_id,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl Session for FakeSession {
    fn info(&self) -> SessionInfo {
        self.info.lock().clone()
    }

    fn add_handler(&self, handler: Handler) {
        self.handlers.lock().push(handler);
    }

    async fn open(&self) -> Result<(), BoxError> {
        self.record("open");
        if self.fail_open {
            return Err(format!("shard {} refused to open", self.shard_id).into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.record("close");
        if self.hang_close {
            std::future::pending::<()>().await;
        }
        if self.fail_close {
            return Err(format!("shard {} failed to close", self.shard_id).into());
        }
        self.info.lock().ready = false;
        Ok(())
    }
}

/// Factory recording every session it builds, with per-shard failure switches
#[derive(Default)]
pub(crate) struct FakeFactory {
    pub(crate) log: CallLog,
    pub(crate) sessions: Mutex<BTreeMap<u32, Arc<FakeSession>>>,
    pub(crate) fail_create_on: Option<u32>,
    pub(crate) fail_open_on: Option<u32>,
    pub(crate) fail_close_on: HashSet<u32>,
    pub(crate) hang_close_on: Option<u32>,
}

impl FakeFactory {
    pub(crate) fn session(&self, shard_id: u32) -> Arc<FakeSession> {
        Arc::clone(&self.sessions.lock()[&shard_id])
    }

    pub(crate) fn calls(&self, op: &str) -> Vec<Call> {
        self.log.lock().iter().filter(|c| c.op == op).cloned().collect()
    }
}

impl SessionFactory for FakeFactory {
    fn create(&self, shard_id: u32, shard_count: u32) -> Result<Arc<dyn Session>, BoxError> {
        if self.fail_create_on == Some(shard_id) {
            return Err(format!("cannot build shard {shard_id}").into());
        }
        let mut session = FakeSession::new(shard_id, shard_count);
        session.log = Arc::clone(&self.log);
        session.fail_open = self.fail_open_on == Some(shard_id);
        session.fail_close = self.fail_close_on.contains(&shard_id);
        session.hang_close = self.hang_close_on == Some(shard_id);

        let session = Arc::new(session);
        self.sessions.lock().insert(shard_id, Arc::clone(&session));
        Ok(session)
    }
}

/// User id [`FakeChannel`] reports as its own
pub(crate) const FAKE_BOT_ID: u64 = 1;

/// Channel double keeping sends and edits
#[derive(Default)]
pub(crate) struct FakeChannel {
    pub(crate) history: Mutex<Vec<ChannelMessage>>,
    pub(crate) sent: Mutex<Vec<(u64, Embed)>>,
    pub(crate) edits: Mutex<Vec<(u64, u64, Embed)>>,
    pub(crate) history_requests: AtomicU64,
    pub(crate) fail_history: AtomicBool,
    pub(crate) fail_user: AtomicBool,
    pub(crate) fail_writes: AtomicBool,
    pub(crate) delay: Option<Duration>,
    next_id: AtomicU64,
}

impl FakeChannel {
    pub(crate) fn with_history(history: Vec<ChannelMessage>) -> Self {
        Self {
            history: Mutex::new(history),
            ..Self::default()
        }
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub(crate) fn edited_ids(&self) -> Vec<u64> {
        self.edits.lock().iter().map(|(_, id, _)| *id).collect()
    }
}

#[async_trait]
impl ChannelClient for FakeChannel {
    async fn current_user_id(&self) -> Result<u64, BoxError> {
        if self.fail_user.load(Ordering::SeqCst) {
            return Err("401: Unauthorized".into());
        }
        Ok(FAKE_BOT_ID)
    }

    async fn fetch_recent_messages(
        &self,
        _channel_id: u64,
        limit: u16,
    ) -> Result<Vec<ChannelMessage>, BoxError> {
        self.history_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_history.load(Ordering::SeqCst) {
            return Err("history unavailable".into());
        }
        Ok(self
            .history
            .lock()
            .iter()
            .take(usize::from(limit))
            .cloned()
            .collect())
    }

    async fn send_message(&self, channel_id: u64, embed: &Embed) -> Result<u64, BoxError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("missing permissions".into());
        }
        self.sent.lock().push((channel_id, embed.clone()));
        Ok(900 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        embed: &Embed,
    ) -> Result<(), BoxError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("missing permissions".into());
        }
        self.edits.lock().push((channel_id, message_id, embed.clone()));
        Ok(())
    }
}
