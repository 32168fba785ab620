//! Event messaging for the award service.
//!
//! This module contains:
//! - `EventPublisher` trait: domain event delivery to a broker
//! - `MessageConsumer` trait: inbound subscription lifecycle
//! - Envelope codec, middleware pipeline and handler registry shared by both
//! - Implementations: Kafka (partitioned log), AWS (EventBridge + SQS), in-memory

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::events::{StickerAssignedToUserEvent, StickerClaimedEvent, StickerRemovedFromUserEvent};

pub mod aws;
pub mod checkpoint;
pub mod envelope;
pub mod factory;
pub mod kafka;
pub mod lifecycle;
pub mod memory;
pub mod pipeline;
pub mod registry;
pub mod telemetry;

// Re-exports
pub use aws::{EventBridgePublisher, SqsConsumer};
pub use checkpoint::{BrokerType, Checkpoint, Direction};
pub use envelope::{ActiveSpan, CloudEvent, SpanLink};
pub use factory::{new_consumer, new_publisher};
pub use kafka::{KafkaConsumer, KafkaPublisher};
pub use lifecycle::ConsumerState;
pub use pipeline::{InboundMessage, MessageContext};
pub use registry::{CloudEventHandler, HandlerRegistration, HandlerRegistry};

// ============================================================================
// Topics
// ============================================================================

/// Outbound topic for sticker assignments.
pub const TOPIC_STICKER_ASSIGNED: &str = "stickers.stickerAssignedToUser.v1";
/// Outbound topic for sticker removals.
pub const TOPIC_STICKER_REMOVED: &str = "stickers.stickerRemovedFromUser.v1";
/// Outbound topic for claimed stickers.
pub const TOPIC_STICKER_CLAIMED: &str = "users.stickerClaimed.v1";
/// Inbound topic (and bus detail-type) for new user registrations.
pub const TOPIC_USER_REGISTERED: &str = "users.userRegistered.v1";

/// Source identifier stamped on everything this service publishes.
pub const SERVICE_SOURCE: &str = "sticker-award";

/// Content type of every serialized envelope.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// String headers travelling alongside a message (checkpoints, trace propagation).
pub type Headers = BTreeMap<String, String>;

// ============================================================================
// Errors
// ============================================================================

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors that can occur while publishing or consuming.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Missing or invalid configuration. Fatal at startup, never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    /// The message body is not a valid event envelope.
    #[error("Invalid event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A business handler rejected the event.
    #[error("Handler '{operation}' failed: {message}")]
    Handler { operation: String, message: String },

    /// One entry of a multi-entry send was rejected by the bus.
    #[error("EventBridge error: {code} - {message}")]
    PartialFailure { code: String, message: String },

    #[error("Consumer has been stopped")]
    Shutdown,
}

impl MessagingError {
    /// Transient broker errors are retried by polling loops after a fixed delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Receive(_))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Interface for publishing sticker domain events.
///
/// Implementations:
/// - `KafkaPublisher`: one topic per event kind, keyed by account id
/// - `EventBridgePublisher`: one detail-type per event kind on a named bus
///
/// Callers log publish failures and carry on: the mutation that produced
/// the event has already committed.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_sticker_assigned(&self, event: &StickerAssignedToUserEvent) -> Result<()>;

    async fn publish_sticker_removed(&self, event: &StickerRemovedFromUserEvent) -> Result<()>;

    async fn publish_sticker_claimed(&self, event: &StickerClaimedEvent) -> Result<()>;

    /// Flush anything buffered and reject later publishes.
    async fn close(&self) -> Result<()>;
}

/// Interface for consuming inbound events.
///
/// Handlers are registered through `&mut self` before the consumer is
/// shared, so the registry is frozen by the time `start` runs.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Register a handler for its topic / detail-type.
    fn register_handler(&mut self, registration: HandlerRegistration) -> Result<()>;

    /// Run until stopped, a termination signal arrives, or the broker fails
    /// unrecoverably. In-flight messages are drained before returning.
    async fn start(&self) -> Result<()>;

    /// Request shutdown and wait until in-flight processing has finished.
    async fn stop(&self) -> Result<()>;

    fn state(&self) -> ConsumerState;
}
