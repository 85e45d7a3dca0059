//! Lifecycle event handling
//!
//! [`LifecycleSink`] is what session handlers call into. It holds the manager
//! state weakly so the sessions it is registered on never keep that state
//! (and through it, themselves) alive.

use crate::error::GatewayError;
use crate::events::{LifecycleEvent, LifecycleKind};
use crate::metrics::GatewayMetrics;
use crate::nats::{PublishLanes, PublishReport, Publisher};
use crate::session::{ChannelClient, Embed};
use crate::shard::state::ManagerState;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Quiet period after a lifecycle event before the status refresh fires
pub const STATUS_DEBOUNCE: Duration = Duration::from_secs(2);

/// Receives every lifecycle event, off the session's callback path
pub type EventObserver = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Default observer: one structured log line per event
pub fn log_observer() -> EventObserver {
    Arc::new(|event: &LifecycleEvent| {
        if event.kind == LifecycleKind::Error {
            warn!(shard_id = event.shard_id, kind = %event.kind, "{event}");
        } else {
            info!(shard_id = event.shard_id, kind = %event.kind, "{event}");
        }
    })
}

/// Renders lifecycle events into the log channel
#[derive(Clone)]
pub struct LogForwarder {
    channels: Arc<dyn ChannelClient>,
    channel_id: u64,
    name: String,
}

impl LogForwarder {
    pub fn new(channels: Arc<dyn ChannelClient>, channel_id: u64, name: impl Into<String>) -> Self {
        Self {
            channels,
            channel_id,
            name: name.into(),
        }
    }

    pub fn render(&self, event: &LifecycleEvent) -> Embed {
        let description = if self.name.is_empty() {
            event.to_string()
        } else {
            format!("{}: {event}", self.name)
        };

        Embed {
            title: None,
            description,
            color: event.kind.color(),
            timestamp: event.time,
        }
    }

    pub async fn forward(&self, event: &LifecycleEvent) -> Result<(), GatewayError> {
        let embed = self.render(event);
        self.channels
            .send_message(self.channel_id, &embed)
            .await
            .map(|_| ())
            .map_err(|source| GatewayError::LogForward {
                channel_id: self.channel_id,
                source,
            })
    }
}

/// Bus subject lifecycle events are mirrored to, one ordered lane per shard
#[derive(Clone)]
pub struct BusTarget {
    lanes: Arc<PublishLanes>,
    subject: String,
}

impl BusTarget {
    pub fn new(publisher: Arc<dyn Publisher>, subject: impl Into<String>, metrics: GatewayMetrics) -> Self {
        let report: PublishReport = Arc::new(
            move |shard_id: u32, subject: &str, result: Result<Duration, GatewayError>| {
                if let Err(e) = result {
                    metrics.record_error(shard_id, e.error_type_label());
                    warn!(shard_id, subject, error = %e, "Failed to publish lifecycle event");
                }
            },
        );

        Self {
            lanes: Arc::new(PublishLanes::new(publisher, report)),
            subject: subject.into(),
        }
    }
}

/// Feeds one long-lived task that runs the observer, in event order
#[derive(Clone)]
struct ObserverLane {
    observer: EventObserver,
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<LifecycleEvent>>>>,
}

impl ObserverLane {
    fn new(observer: EventObserver) -> Self {
        Self {
            observer,
            tx: Arc::default(),
        }
    }

    /// Started on first use so a sink can be built outside a runtime
    fn push(&self, event: LifecycleEvent) {
        let mut tx = self.tx.lock();
        let event = match tx.as_ref() {
            Some(sender) => match sender.send(event) {
                Ok(()) => return,
                // Observer task is gone, start a new one
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        self.start(&mut tx, event);
    }

    fn start(&self, slot: &mut Option<mpsc::UnboundedSender<LifecycleEvent>>, first: LifecycleEvent) {
        let (sender, mut rx) = mpsc::unbounded_channel::<LifecycleEvent>();
        let observer = Arc::clone(&self.observer);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                observer(&event);
            }
        });
        let _ = sender.send(first);
        *slot = Some(sender);
    }
}

#[derive(Clone)]
pub struct LifecycleSink {
    state: Weak<RwLock<ManagerState>>,
    observer: Option<ObserverLane>,
    forwarder: Option<LogForwarder>,
    bus: Option<BusTarget>,
    metrics: GatewayMetrics,
}

impl LifecycleSink {
    pub fn new(state: &Arc<RwLock<ManagerState>>) -> Self {
        Self {
            state: Arc::downgrade(state),
            observer: Some(ObserverLane::new(log_observer())),
            forwarder: None,
            bus: None,
            metrics: GatewayMetrics::detached(),
        }
    }

    pub fn set_observer(&mut self, observer: Option<EventObserver>) {
        self.observer = observer.map(ObserverLane::new);
    }

    pub fn set_forwarder(&mut self, forwarder: Option<LogForwarder>) {
        self.forwarder = forwarder;
    }

    pub fn set_bus(&mut self, bus: Option<BusTarget>) {
        self.bus = bus;
    }

    pub fn set_metrics(&mut self, metrics: GatewayMetrics) {
        self.metrics = metrics;
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Record a lifecycle signal for `shard_id` and fan it out.
    ///
    /// The state lock is held only to apply the transition, read the shard
    /// count and defer the status refresh. Observer, log channel and bus all
    /// run on their own tasks, so this returns without waiting on I/O. The
    /// observer and the bus see events in the order they were handled.
    pub fn handle_event(&self, kind: LifecycleKind, shard_id: u32, message: impl Into<String>) {
        let Some(state) = self.state.upgrade() else {
            return;
        };

        let shard_count = {
            let mut guard = state.write();
            if kind != LifecycleKind::Error {
                guard.defer_status(Instant::now(), STATUS_DEBOUNCE);
            }
            let fallback = guard.sessions.values().next().map_or(1, |r| r.shard_count);
            match guard.sessions.get_mut(&shard_id) {
                Some(record) => {
                    record.state = record.state.on_event(kind);
                    record.shard_count
                }
                None => fallback,
            }
        };

        let event = LifecycleEvent::new(kind, shard_id, shard_count, message);
        self.metrics.record_lifecycle(shard_id, kind);

        if let Some(observer) = &self.observer {
            observer.push(event.clone());
        }

        if let Some(bus) = &self.bus {
            match serde_json::to_vec(&event.to_message()) {
                Ok(payload) => {
                    if let Err(e) = bus.lanes.enqueue(shard_id, &bus.subject, payload) {
                        self.metrics.record_error(shard_id, e.error_type_label());
                        warn!(shard_id, error = %e, "Dropping lifecycle event");
                    }
                }
                Err(source) => {
                    let err = GatewayError::SerializationFailed {
                        event_type: kind.name().to_string(),
                        shard_id,
                        source,
                    };
                    self.metrics.record_error(shard_id, err.error_type_label());
                    warn!(shard_id, error = %err, "Failed to encode lifecycle event");
                }
            }
        }

        // Errors are not forwarded, a failing channel would feed itself
        if kind == LifecycleKind::Error {
            return;
        }
        if let Some(forwarder) = &self.forwarder {
            let forwarder = forwarder.clone();
            let sink = self.clone();
            tokio::spawn(async move {
                if let Err(e) = forwarder.forward(&event).await {
                    sink.handle_error(shard_id, "Failed sending event to discord", &e);
                }
            });
        }
    }

    /// Log a contained failure and report it as an Error lifecycle event
    pub fn handle_error(&self, shard_id: u32, context: &str, err: &GatewayError) {
        self.metrics.record_error(shard_id, err.error_type_label());
        warn!(shard_id, error = %err, "{context}");
        self.handle_event(LifecycleKind::Error, shard_id, format!("{context}: {err}"));
    }
}
