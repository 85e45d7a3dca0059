//! Shard manager
//!
//! Owns one session per shard id in `[offset, offset + count)` and drives
//! them through init, staggered start and sequential shutdown. Sessions only
//! see the [`Handler`] values registered on them; everything they report
//! flows through the [`LifecycleSink`] or the [`EventRouter`].

use crate::error::{BoxError, GatewayError, ShardFailure};
use crate::events::{EventRouter, LifecycleKind};
use crate::metrics::GatewayMetrics;
use crate::nats::Publisher;
use crate::session::{ChannelClient, Handler, Session, SessionFactory};
use crate::shard::sink::{BusTarget, EventObserver, LifecycleSink, LogForwarder};
use crate::shard::state::{snapshot, ManagerState, SessionRecord, SessionState, ShardSnapshot};
use crate::status::{GuildCounter, StatusReporter};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Gap between successive shard opens (identify rate limit)
pub const STAGGER_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on a single session close during shutdown
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Display name used in the status title and forwarded log lines
    pub name: String,
    pub shard_offset: u32,
    /// Shards managed by this process; `None` covers the rest of the space
    pub shard_count: Option<u32>,
    pub total_shards: u32,
    pub stagger: Duration,
    pub close_timeout: Duration,
    pub log_channel: Option<u64>,
    pub status_channel: Option<u64>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            shard_offset: 0,
            shard_count: None,
            total_shards: 1,
            stagger: STAGGER_INTERVAL,
            close_timeout: CLOSE_TIMEOUT,
            log_channel: None,
            status_channel: None,
        }
    }
}

impl ManagerSettings {
    /// Effective `(offset, count, total)`.
    ///
    /// An unconfigured deployment (`total_shards == 0`) is a single shard
    /// spanning the whole space.
    pub fn resolve(&self) -> (u32, u32, u32) {
        if self.total_shards == 0 {
            return (0, 1, 1);
        }
        let count = self
            .shard_count
            .unwrap_or_else(|| self.total_shards.saturating_sub(self.shard_offset));
        (self.shard_offset, count, self.total_shards)
    }

    pub fn shard_range(&self) -> Result<Range<u32>, GatewayError> {
        let (offset, count, _) = self.resolve();
        let end = offset
            .checked_add(count)
            .ok_or(GatewayError::ShardIdOverflow {
                value: u64::from(offset) + u64::from(count),
            })?;
        Ok(offset..end)
    }
}

pub struct ShardManager {
    settings: ManagerSettings,
    factory: Arc<dyn SessionFactory>,
    router: Arc<EventRouter>,
    channels: Option<Arc<dyn ChannelClient>>,
    guild_counter: Option<GuildCounter>,
    sink: LifecycleSink,
    state: Arc<RwLock<ManagerState>>,
}

impl ShardManager {
    pub fn new(
        settings: ManagerSettings,
        factory: Arc<dyn SessionFactory>,
        router: Arc<EventRouter>,
    ) -> Self {
        let state = Arc::new(RwLock::new(ManagerState::default()));
        let sink = LifecycleSink::new(&state);

        Self {
            settings,
            factory,
            router,
            channels: None,
            guild_counter: None,
            sink,
            state,
        }
    }

    /// Channel client for the status message and, when a log channel is
    /// configured, lifecycle log forwarding
    pub fn with_channel_client(mut self, channels: Arc<dyn ChannelClient>) -> Self {
        if let Some(channel_id) = self.settings.log_channel {
            self.sink.set_forwarder(Some(LogForwarder::new(
                Arc::clone(&channels),
                channel_id,
                self.settings.name.clone(),
            )));
        }
        self.channels = Some(channels);
        self
    }

    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.sink.set_observer(Some(observer));
        self
    }

    pub fn without_observer(mut self) -> Self {
        self.sink.set_observer(None);
        self
    }

    /// Mirror lifecycle events onto `subject`
    pub fn with_bus(mut self, publisher: Arc<dyn Publisher>, subject: impl Into<String>) -> Self {
        let metrics = self.sink.metrics().clone();
        self.sink
            .set_bus(Some(BusTarget::new(publisher, subject, metrics)));
        self
    }

    pub fn with_guild_counter(mut self, counter: GuildCounter) -> Self {
        self.guild_counter = Some(counter);
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.sink.set_metrics(metrics);
        self
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Build one session per shard and register handlers on it.
    ///
    /// A factory failure aborts init before anything is installed. Calling
    /// init again after success is a no-op.
    pub fn init(&self) -> Result<(), GatewayError> {
        let registered = {
            let state = self.state.read();
            if state.initialized {
                debug!("Shard manager already initialized");
                return Ok(());
            }
            state.handlers.clone()
        };

        let range = self.settings.shard_range()?;
        let (_, _, total) = self.settings.resolve();

        let mut sessions = BTreeMap::new();
        for shard_id in range.clone() {
            let handle = self
                .factory
                .create(shard_id, total)
                .map_err(|source| GatewayError::SessionInit { shard_id, source })?;

            for handler in self.canonical_handlers(total) {
                handle.add_handler(handler);
            }
            for handler in &registered {
                handle.add_handler(handler.clone());
            }
            sessions.insert(shard_id, SessionRecord::new(shard_id, total, handle));
        }

        {
            let mut state = self.state.write();
            // Handlers added while the sessions were being built
            let late = state.handlers.get(registered.len()..).unwrap_or_default();
            for record in sessions.values() {
                for handler in late {
                    record.handle.add_handler(handler.clone());
                }
            }
            state.install(sessions, Instant::now());
        }

        info!(
            first_shard = range.start,
            last_shard = range.end.saturating_sub(1),
            total_shards = total,
            "Shard sessions initialized"
        );

        self.spawn_status_reporter();
        Ok(())
    }

    fn canonical_handlers(&self, total: u32) -> Vec<Handler> {
        let lifecycle = |kind: LifecycleKind| {
            let sink = self.sink.clone();
            move |shard_id: u32| sink.handle_event(kind, shard_id, "")
        };

        vec![
            Handler::on_connected(lifecycle(LifecycleKind::Connected)),
            Handler::on_disconnected(lifecycle(LifecycleKind::Disconnected)),
            Handler::on_ready(lifecycle(LifecycleKind::Ready)),
            Handler::on_resumed(lifecycle(LifecycleKind::Resumed)),
            self.router.handler(total),
        ]
    }

    fn spawn_status_reporter(&self) {
        let (Some(channel_id), Some(channels)) = (self.settings.status_channel, &self.channels) else {
            return;
        };

        let reporter = StatusReporter::new(
            Arc::clone(&self.state),
            Arc::clone(channels),
            channel_id,
            &self.settings.name,
            self.sink.clone(),
        )
        .with_guild_counter(self.guild_counter.clone());

        let task = tokio::spawn(reporter.run());
        self.state.write().status_task = Some(task);
        info!(channel_id, "Status reporter started");
    }

    /// Register a handler on every current and future session
    pub fn add_handler(&self, handler: Handler) {
        let handles = {
            let mut state = self.state.write();
            state.handlers.push(handler.clone());
            state.handles()
        };

        for (_, handle) in handles {
            handle.add_handler(handler.clone());
        }
    }

    pub fn started(&self) -> bool {
        self.state.read().started
    }

    pub fn session(&self, shard_id: u32) -> Option<Arc<dyn Session>> {
        self.state
            .read()
            .sessions
            .get(&shard_id)
            .map(|r| Arc::clone(&r.handle))
    }

    pub fn snapshot(&self) -> Vec<ShardSnapshot> {
        snapshot(&self.state)
    }

    pub fn ready_count(&self) -> usize {
        self.snapshot().iter().filter(|s| s.info.ready).count()
    }

    /// Open every shard, then wait for `shutdown` and close them all.
    ///
    /// Shards open in increasing id order with the stagger interval between
    /// opens. The first open failure is returned and later shards are left
    /// unopened. A shutdown during startup skips straight to [`stop_all`].
    ///
    /// [`stop_all`]: Self::stop_all
    pub async fn start<F>(&self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()>,
    {
        self.init()?;

        let handles = self.state.read().handles();
        tokio::pin!(shutdown);

        tokio::select! {
            result = self.open_all(&handles) => {
                if let Err(e) = result {
                    error!(error = %e, "Shard startup aborted");
                    return Err(e);
                }
            }
            () = &mut shutdown => {
                info!("Shutdown requested during startup");
                return self.stop_all().await;
            }
        }

        self.state.write().started = true;
        info!(shards = handles.len(), "All shards open");

        shutdown.await;
        info!("Shutdown signal received, closing sessions");
        self.stop_all().await
    }

    async fn open_all(&self, handles: &[(u32, Arc<dyn Session>)]) -> Result<(), GatewayError> {
        for (i, (shard_id, handle)) in handles.iter().enumerate() {
            let shard_id = *shard_id;
            if i > 0 {
                tokio::time::sleep(self.settings.stagger).await;
            }

            self.state.write().set_state(shard_id, SessionState::Opening);
            info!(shard_id, "Opening session");

            handle
                .open()
                .await
                .map_err(|source| GatewayError::SessionOpen { shard_id, source })?;

            self.sink.handle_event(LifecycleKind::Opened, shard_id, "");
        }
        Ok(())
    }

    /// Close every session in shard order.
    ///
    /// Each close is bounded by the close timeout. Failures do not stop the
    /// remaining closes; all of them are returned together.
    pub async fn stop_all(&self) -> Result<(), GatewayError> {
        let (handles, reporter) = {
            let mut state = self.state.write();
            state.started = false;
            (state.handles(), state.status_task.take())
        };

        if let Some(task) = reporter {
            task.abort();
        }

        let timeout = self.settings.close_timeout;
        let mut failures = Vec::new();

        for (shard_id, handle) in handles {
            let result = match tokio::time::timeout(timeout, handle.close()).await {
                Ok(result) => result,
                Err(_) => Err(BoxError::from(format!("close timed out after {timeout:?}"))),
            };

            match result {
                Ok(()) => self.sink.handle_event(LifecycleKind::Closed, shard_id, ""),
                Err(source) => {
                    warn!(shard_id, error = %source, "Failed to close session");
                    self.state.write().set_state(shard_id, SessionState::Closed);
                    failures.push(ShardFailure { shard_id, source });
                }
            }
        }

        if failures.is_empty() {
            info!("All sessions closed");
            Ok(())
        } else {
            Err(GatewayError::SessionClose { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, PayloadEvent};
    use crate::nats::recording::RecordingPublisher;
    use crate::nats::subjects;
    use crate::session::fake::{FakeChannel, FakeFactory};
    use crate::session::Signal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn settings(offset: u32, count: Option<u32>, total: u32) -> ManagerSettings {
        ManagerSettings {
            shard_offset: offset,
            shard_count: count,
            total_shards: total,
            ..ManagerSettings::default()
        }
    }

    fn local_router() -> Arc<EventRouter> {
        Arc::new(EventRouter::new(
            None,
            subjects::EVENTS,
            EventFilter::default(),
            GatewayMetrics::detached(),
        ))
    }

    fn manager(factory: &Arc<FakeFactory>, settings: ManagerSettings) -> ShardManager {
        ShardManager::new(settings, factory.clone(), local_router()).without_observer()
    }

    fn states(manager: &ShardManager) -> Vec<SessionState> {
        manager.snapshot().iter().map(|s| s.state).collect()
    }

    #[test]
    fn unconfigured_total_is_one_shard() {
        assert_eq!(settings(0, None, 0).resolve(), (0, 1, 1));
        assert_eq!(settings(0, None, 4).resolve(), (0, 4, 4));
        assert_eq!(settings(2, None, 8).resolve(), (2, 6, 8));
        assert_eq!(settings(2, Some(3), 8).resolve(), (2, 3, 8));
    }

    #[test]
    fn overflowing_range_is_rejected() {
        let err = settings(u32::MAX, Some(2), u32::MAX).shard_range().unwrap_err();
        assert!(matches!(err, GatewayError::ShardIdOverflow { .. }));
    }

    #[tokio::test]
    async fn init_builds_exactly_the_configured_range() {
        for (offset, count, total) in [(0, None, 1), (0, None, 4), (2, Some(2), 4), (3, Some(1), 8)] {
            let factory = Arc::new(FakeFactory::default());
            let manager = manager(&factory, settings(offset, count, total));
            manager.init().unwrap();

            let (offset, count, total) = manager.settings().resolve();
            let ids: Vec<u32> = factory.sessions.lock().keys().copied().collect();
            assert_eq!(ids, (offset..offset + count).collect::<Vec<_>>());

            for shard in manager.snapshot() {
                assert_eq!(shard.info.shard_count, total);
                assert_eq!(shard.state, SessionState::Initialized);
            }
            assert!(!manager.started());
        }
    }

    #[tokio::test]
    async fn init_failure_exposes_no_sessions() {
        let factory = Arc::new(FakeFactory {
            fail_create_on: Some(1),
            ..FakeFactory::default()
        });
        let manager = manager(&factory, settings(0, None, 3));

        let err = assert_err!(manager.init());

        assert!(matches!(err, GatewayError::SessionInit { shard_id: 1, .. }));
        assert!(err.is_fatal());
        assert!(manager.session(0).is_none());
        assert!(manager.snapshot().is_empty());
    }

    #[tokio::test]
    async fn handlers_added_before_and_after_init_both_apply() {
        let factory = Arc::new(FakeFactory::default());
        let manager = manager(&factory, settings(0, None, 2));
        let early = Arc::new(AtomicU32::new(0));
        let late = Arc::new(AtomicU32::new(0));

        manager.add_handler({
            let early = Arc::clone(&early);
            Handler::on_ready(move |_| {
                early.fetch_add(1, Ordering::SeqCst);
            })
        });
        manager.init().unwrap();
        manager.add_handler({
            let late = Arc::clone(&late);
            Handler::on_ready(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            })
        });

        for shard_id in 0..2 {
            let session = factory.session(shard_id);
            // 4 lifecycle handlers and the payload router, plus both user handlers
            assert_eq!(session.handler_count(), 7);
            session.fire(Signal::Ready);
        }

        assert_eq!(early.load(Ordering::SeqCst), 2);
        assert_eq!(late.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_in_order_with_stagger() {
        let factory = Arc::new(FakeFactory::default());
        let manager = manager(&factory, settings(0, None, 3));

        assert_ok!(manager.start(tokio::time::sleep(Duration::from_secs(60))).await);

        let opens = factory.calls("open");
        let ids: Vec<u32> = opens.iter().map(|c| c.shard_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        for pair in opens.windows(2) {
            assert!(pair[1].at - pair[0].at >= STAGGER_INTERVAL);
        }

        assert_eq!(factory.calls("close").len(), 3);
        assert!(states(&manager).iter().all(|s| *s == SessionState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn started_is_set_once_every_shard_is_open() {
        let factory = Arc::new(FakeFactory::default());
        let manager = Arc::new(manager(&factory, settings(0, None, 2)));
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let task = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move {
                manager
                    .start(async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!manager.started());

        tokio::time::sleep(STAGGER_INTERVAL).await;
        assert!(manager.started());
        assert_eq!(states(&manager), vec![SessionState::Open; 2]);

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!manager.started());
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_stops_startup() {
        let factory = Arc::new(FakeFactory {
            fail_open_on: Some(1),
            ..FakeFactory::default()
        });
        let manager = manager(&factory, settings(0, None, 3));

        let err = assert_err!(manager.start(std::future::pending()).await);

        assert!(matches!(err, GatewayError::SessionOpen { shard_id: 1, .. }));
        let ids: Vec<u32> = factory.calls("open").iter().map(|c| c.shard_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert!(!manager.started());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_startup_closes_everything() {
        let factory = Arc::new(FakeFactory::default());
        let manager = manager(&factory, settings(0, None, 3));

        assert_ok!(manager.start(tokio::time::sleep(Duration::from_secs(2))).await);

        assert_eq!(factory.calls("open").len(), 1);
        assert_eq!(factory.calls("close").len(), 3);
        assert!(!manager.started());
    }

    #[tokio::test]
    async fn stop_all_closes_every_session_despite_failures() {
        let factory = Arc::new(FakeFactory {
            fail_close_on: [1].into_iter().collect(),
            ..FakeFactory::default()
        });
        let manager = manager(&factory, settings(0, None, 3));
        manager.init().unwrap();

        let err = manager.stop_all().await.unwrap_err();

        let ids: Vec<u32> = factory.calls("close").iter().map(|c| c.shard_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        let GatewayError::SessionClose { failures } = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].shard_id, 1);
        assert_eq!(failures[0].source.to_string(), "shard 1 failed to close");
        assert!(!err.is_fatal());
        assert!(states(&manager).iter().all(|s| *s == SessionState::Closed));
    }

    #[tokio::test]
    async fn stop_all_reports_every_failure() {
        let factory = Arc::new(FakeFactory {
            fail_close_on: [0, 2].into_iter().collect(),
            ..FakeFactory::default()
        });
        let manager = manager(&factory, settings(0, None, 3));
        manager.init().unwrap();

        let err = manager.stop_all().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "failed to close 2 session(s): shard 0: shard 0 failed to close; shard 2: shard 2 failed to close"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_close_times_out_and_shutdown_proceeds() {
        let factory = Arc::new(FakeFactory {
            hang_close_on: Some(0),
            ..FakeFactory::default()
        });
        let manager = manager(&factory, settings(0, None, 3));
        manager.init().unwrap();

        let started = Instant::now();
        let err = manager.stop_all().await.unwrap_err();

        assert!(started.elapsed() >= CLOSE_TIMEOUT);
        let GatewayError::SessionClose { failures } = err else {
            panic!("expected close failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].shard_id, 0);
        assert_eq!(factory.calls("close").len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lifecycle_events_are_race_free() {
        const SHARDS: u32 = 8;
        let factory = Arc::new(FakeFactory::default());
        let manager = manager(&factory, settings(0, None, SHARDS));
        manager.init().unwrap();
        for shard_id in 0..SHARDS {
            manager.state.write().set_state(shard_id, SessionState::Open);
        }

        let before = Instant::now();
        let tasks: Vec<_> = (0..SHARDS)
            .map(|shard_id| {
                let session = factory.session(shard_id);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        session.fire(Signal::Disconnected);
                        session.fire(Signal::Resumed);
                        session.fire(Signal::Connected);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(states(&manager), vec![SessionState::Open; SHARDS as usize]);
        assert!(manager.state.read().next_status_due >= before + crate::shard::sink::STATUS_DEBOUNCE);
    }

    #[tokio::test]
    async fn payload_from_session_reaches_the_bus() {
        let factory = Arc::new(FakeFactory::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let bus: Arc<dyn Publisher> = publisher.clone();
        let router = Arc::new(EventRouter::new(
            Some(bus),
            subjects::EVENTS,
            EventFilter::default(),
            GatewayMetrics::detached(),
        ));
        let manager = ShardManager::new(settings(2, Some(1), 4), factory.clone(), router).without_observer();
        manager.init().unwrap();

        factory
            .session(2)
            .fire_payload(PayloadEvent::dispatch("MESSAGE_CREATE", br#"{"content":"hi"}"#.to_vec()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let published = publisher.on_subject(subjects::EVENTS);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0]["type"], "MESSAGE_CREATE");
        assert_eq!(published[0]["shard"], 3);
        assert_eq!(published[0]["numShards"], 4);
        assert_eq!(published[0]["data"]["content"], "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn status_reporter_runs_until_stop() {
        let factory = Arc::new(FakeFactory::default());
        let channel = Arc::new(FakeChannel::default());
        let manager = manager(
            &factory,
            ManagerSettings {
                name: "Keeper".to_string(),
                status_channel: Some(5),
                ..settings(0, None, 1)
            },
        )
        .with_channel_client(channel.clone());

        manager.init().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(channel.history_requests.load(Ordering::SeqCst), 1);
        assert_eq!(channel.sent_count(), 1);
        let sent = channel.sent.lock()[0].1.clone();
        assert_eq!(sent.title.as_deref(), Some("Sharding status for Keeper"));

        manager.stop_all().await.unwrap();
        assert!(manager.state.read().status_task.is_none());
    }

    #[tokio::test]
    async fn lifecycle_events_are_forwarded_to_log_channel() {
        let factory = Arc::new(FakeFactory::default());
        let channel = Arc::new(FakeChannel::default());
        let manager = manager(
            &factory,
            ManagerSettings {
                log_channel: Some(42),
                ..settings(0, None, 2)
            },
        )
        .with_channel_client(channel.clone());
        manager.init().unwrap();

        factory.session(1).fire(Signal::Connected);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = channel.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 42);
        assert_eq!(sent[0].1.description, "Discord [2/2] Connected");
    }
}
