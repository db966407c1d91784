//! `pulseguard-middleware` – event routing out of the safety core.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels; one bounded lane per exposed stream.
//! - [`audit`] – [`AuditSink`][audit::AuditSink] seam towards the external
//!   audit store and the [`AuditForwarder`][audit::AuditForwarder] that feeds
//!   it with bounded retry.

pub mod audit;
pub mod bus;

pub use audit::{AuditForwarder, AuditSink, MemoryAuditSink, next_event};
pub use bus::{EventBus, Topic, TopicReceiver};
