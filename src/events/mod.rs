//! Event handling module
//!
//! Lifecycle and payload event models, the type filter and the router that
//! publishes accepted payloads to the bus.

pub mod envelope;
pub mod filter;
pub mod lifecycle;
pub mod router;

pub use envelope::{OutboundEnvelope, PayloadEvent, DISPATCH_OPCODE};
pub use filter::EventFilter;
pub use lifecycle::{LifecycleEvent, LifecycleKind, LifecycleMessage};
pub use router::EventRouter;
