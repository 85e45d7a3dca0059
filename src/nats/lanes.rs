//! Per-shard publish lanes
//!
//! Session callbacks must not wait on the bus, yet one shard's messages have
//! to reach it in the order the session handed them over. Each shard gets a
//! single long-lived task draining a bounded queue; callers only enqueue.

use super::Publisher;
use crate::error::GatewayError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Messages a shard may have queued before new ones are dropped
pub const LANE_CAPACITY: usize = 4096;

/// Called after every publish attempt with the shard, subject and latency
pub type PublishReport = Arc<dyn Fn(u32, &str, Result<Duration, GatewayError>) + Send + Sync>;

struct Outbound {
    subject: String,
    payload: Vec<u8>,
}

pub struct PublishLanes {
    publisher: Arc<dyn Publisher>,
    report: PublishReport,
    capacity: usize,
    lanes: Mutex<HashMap<u32, mpsc::Sender<Outbound>>>,
}

impl PublishLanes {
    pub fn new(publisher: Arc<dyn Publisher>, report: PublishReport) -> Self {
        Self {
            publisher,
            report,
            capacity: LANE_CAPACITY,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Queue `payload` behind everything `shard_id` queued before it.
    ///
    /// Never waits. A full lane rejects the message instead of blocking the
    /// session that produced it.
    pub fn enqueue(&self, shard_id: u32, subject: &str, payload: Vec<u8>) -> Result<(), GatewayError> {
        let backlog = || GatewayError::PublishBacklog {
            shard_id,
            subject: subject.to_string(),
        };

        let mut lanes = self.lanes.lock();
        let mut message = Outbound {
            subject: subject.to_string(),
            payload,
        };

        if let Some(tx) = lanes.get(&shard_id) {
            match tx.try_send(message) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(_)) => return Err(backlog()),
                // Lane task is gone, start a new one
                Err(TrySendError::Closed(returned)) => message = returned,
            }
        }

        let tx = self.spawn_lane(shard_id);
        let result = tx.try_send(message).map_err(|_| backlog());
        lanes.insert(shard_id, tx);
        result
    }

    fn spawn_lane(&self, shard_id: u32) -> mpsc::Sender<Outbound> {
        let (tx, mut rx) = mpsc::channel::<Outbound>(self.capacity);
        let publisher = Arc::clone(&self.publisher);
        let report = Arc::clone(&self.report);

        tokio::spawn(async move {
            while let Some(Outbound { subject, payload }) = rx.recv().await {
                let start = Instant::now();
                let result = publisher
                    .publish(&subject, payload)
                    .await
                    .map(|()| start.elapsed());
                report(shard_id, &subject, result);
            }
        });

        tx
    }
}
