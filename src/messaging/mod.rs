//! # Messaging Module
//!
//! Log-stream message bus for supervisor/worker coordination: the envelope and
//! its wire encoding, pluggable stream transports, consumer-group subscriptions
//! and the [`MessageBus`] facade tying them together.

pub mod bus;
pub mod envelope;
pub mod errors;
pub mod shutdown;
pub mod subscription;
pub mod transport;

pub use bus::{BusHealthReport, BusStats, BusStatsSnapshot, MessageBus};
pub use envelope::{
    MessageEnvelope, MessageKind, MessagePriority, Payload, WireFields, DEFAULT_MAX_RETRIES,
};
pub use errors::{MessagingError, MessagingResult};
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use subscription::{
    handler_fn, DeliveryOutcome, EnvelopeHandler, FnHandler, ForeignTargetPolicy,
    SubscribeOptions, SubscriptionId, SubscriptionInfo,
};
pub use transport::{EntryId, GroupStart, InMemoryLogStream, LogStreamTransport, StreamEntry};
#[cfg(feature = "redis-streams")]
pub use transport::RedisLogStream;
