//! NATS integration
//!
//! Publishes gateway envelopes and lifecycle events to NATS subjects.

mod lanes;
mod publisher;

pub use lanes::{PublishLanes, PublishReport, LANE_CAPACITY};
pub use publisher::{subjects, NatsPublisher, Publisher};
