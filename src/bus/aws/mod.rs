//! AWS publisher and consumer: EventBridge for outbound events, SQS for inbound.
//!
//! Outbound events are put on a named bus with one detail-type per event
//! kind. Inbound events arrive on an SQS queue subscribed to the bus, each
//! message body being the bus's outer envelope with the CloudEvent carried
//! as a JSON string in `detail`.
//!
//! Acknowledgment: a message is deleted only after its handler succeeded.
//! Failures stay on the queue and are redelivered once the visibility
//! timeout expires.

#[cfg(feature = "aws")]
pub mod client;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::checkpoint::{BrokerType, Checkpoint};
use super::envelope::CloudEvent;
use super::lifecycle::{ConsumerState, Lifecycle};
use super::pipeline::InboundMessage;
use super::registry::{HandlerRegistration, HandlerRegistry};
use super::{
    telemetry, EventPublisher, Headers, MessageConsumer, MessagingError, Result,
    JSON_CONTENT_TYPE, SERVICE_SOURCE,
};
use crate::config::AwsConfig;
use crate::events::{
    PublishedEvent, StickerAssignedToUserEvent, StickerClaimedEvent, StickerRemovedFromUserEvent,
};

/// CloudEvent `source` for envelopes put on the bus.
pub const BUS_EVENT_SOURCE: &str = "https://stickerlandia.com/sticker-award";

/// SQS caps a single receive at ten messages.
pub const MAX_RECEIVE_MESSAGES: i32 = 10;

// ============================================================================
// Primitives
// ============================================================================

/// One `PutEvents` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEntry {
    pub event_bus_name: String,
    pub source: String,
    pub detail_type: String,
    pub detail: String,
}

/// Per-entry outcome of a `PutEvents` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusEntryResult {
    pub event_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl BusEntryResult {
    pub fn failed(&self) -> bool {
        self.error_code.is_some()
    }
}

#[async_trait]
pub trait EventBusClient: Send + Sync {
    /// Put `entries` on the bus. Results are returned in entry order.
    async fn put_events(&self, entries: Vec<BusEntry>) -> Result<Vec<BusEntryResult>>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub receipt_handle: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: i32,
    /// Long-poll duration.
    pub wait_time_secs: i32,
    /// How long received messages stay hidden from other receivers.
    pub visibility_timeout_secs: i32,
}

impl ReceiveOptions {
    pub fn from_config(config: &AwsConfig) -> Self {
        Self {
            max_messages: MAX_RECEIVE_MESSAGES,
            wait_time_secs: config.effective_wait_time_secs(),
            visibility_timeout_secs: config.effective_visibility_timeout_secs(),
        }
    }
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>>;

    async fn delete(&self, receipt_handle: &str) -> Result<()>;

    /// Cheap round-trip proving the queue exists and is reachable.
    async fn check_reachable(&self) -> Result<()>;
}

// ============================================================================
// Outer envelope
// ============================================================================

/// The bus's native event shape, as delivered to queue subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OuterEnvelope {
    pub version: String,
    pub id: String,
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    pub source: String,
    pub time: String,
    pub region: String,
    pub resources: Vec<String>,
    /// Inner CloudEvent as a JSON string.
    #[serde(deserialize_with = "detail_as_string")]
    pub detail: String,
    pub account: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Buses deliver `detail` as an object, test fixtures and replays often as
/// an encoded string. Both end up as the encoded string.
fn detail_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(detail) => Ok(detail),
        serde_json::Value::Null => Ok(String::new()),
        other => Ok(other.to_string()),
    }
}

/// Only the correlation bag of an inner envelope.
#[derive(Deserialize)]
struct HeaderPeek {
    #[serde(rename = "datadog", default)]
    headers: serde_json::Map<String, serde_json::Value>,
}

/// Read the correlation headers out of an inner envelope without decoding
/// the payload; the pipeline parses the full envelope afterwards.
///
/// Non-string values are dropped. A detail that is not JSON yields no headers.
pub fn peek_headers(detail: &str) -> Headers {
    match serde_json::from_str::<HeaderPeek>(detail) {
        Ok(peek) => peek
            .headers
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::String(value) => Some((key, value)),
                _ => None,
            })
            .collect(),
        Err(e) => {
            debug!(error = %e, "No correlation headers in event detail");
            Headers::new()
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Publishes sticker events to an EventBridge bus.
pub struct EventBridgePublisher {
    client: Arc<dyn EventBusClient>,
    bus_name: String,
    closed: AtomicBool,
}

impl EventBridgePublisher {
    pub fn new(client: Arc<dyn EventBusClient>, bus_name: impl Into<String>) -> Self {
        Self {
            client,
            bus_name: bus_name.into(),
            closed: AtomicBool::new(false),
        }
    }

    /// Build an SDK client from ambient AWS credentials.
    #[cfg(feature = "aws")]
    pub async fn connect(config: &AwsConfig) -> Result<Self> {
        let sdk_config = client::load_sdk_config(config).await;
        let bus = client::SdkEventBusClient::new(&sdk_config);
        info!(
            bus = %config.event_bus_name,
            region = %config.region,
            "Created EventBridge publisher"
        );
        Ok(Self::new(Arc::new(bus), config.event_bus_name.clone()))
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    async fn publish_event<E: PublishedEvent>(&self, event: &E) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Publish("publisher is closed".to_string()));
        }

        let detail_type = E::DETAIL_TYPE;
        let key = event.subject_id();
        let span = telemetry::producer_span(BrokerType::Eventbridge.messaging_system(), detail_type);
        span.record("aws.eventbridge.bus", self.bus_name.as_str());

        let result: Result<()> = async {
            let mut envelope = CloudEvent::wrap(
                E::CLOUD_EVENT_TYPE,
                BUS_EVENT_SOURCE,
                event,
                telemetry::active_span(),
            )
            .with_content_type(JSON_CONTENT_TYPE);
            Checkpoint::outbound(BrokerType::Eventbridge, detail_type)
                .inject(&mut envelope.headers)?;
            telemetry::inject_context(&mut envelope.headers);

            let detail = serde_json::to_string(&envelope).map_err(|e| {
                MessagingError::Serialization(format!("failed to serialize cloud event: {}", e))
            })?;

            let results = self
                .client
                .put_events(vec![BusEntry {
                    event_bus_name: self.bus_name.clone(),
                    source: SERVICE_SOURCE.to_string(),
                    detail_type: detail_type.to_string(),
                    detail,
                }])
                .await?;

            // Only the first failed entry is reported.
            if let Some(failed) = results.iter().find(|r| r.failed()) {
                return Err(MessagingError::PartialFailure {
                    code: failed.error_code.clone().unwrap_or_default(),
                    message: failed.error_message.clone().unwrap_or_default(),
                });
            }

            info!(
                detail_type = %detail_type,
                bus = %self.bus_name,
                key = %key,
                event_id = %envelope.id,
                "Successfully published event"
            );
            Ok(())
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            telemetry::record_error(&span, e);
            error!(
                detail_type = %detail_type,
                bus = %self.bus_name,
                key = %key,
                error = %e,
                "Failed to publish event"
            );
        }

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, PUBLISH_TOTAL};
            PUBLISH_TOTAL.add(
                1,
                &[
                    metrics::system_attr(BrokerType::Eventbridge.messaging_system()),
                    metrics::topic_attr(detail_type),
                    metrics::outcome_attr(metrics::outcome_of(&result)),
                ],
            );
        }

        result
    }
}

#[async_trait]
impl EventPublisher for EventBridgePublisher {
    async fn publish_sticker_assigned(&self, event: &StickerAssignedToUserEvent) -> Result<()> {
        self.publish_event(event).await
    }

    async fn publish_sticker_removed(&self, event: &StickerRemovedFromUserEvent) -> Result<()> {
        self.publish_event(event).await
    }

    async fn publish_sticker_claimed(&self, event: &StickerClaimedEvent) -> Result<()> {
        self.publish_event(event).await
    }

    /// Every put is synchronous, so there is nothing to flush.
    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(bus = %self.bus_name, "EventBridge publisher closed");
        }
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// SQS queue poller with a bounded pool of per-message tasks.
pub struct SqsConsumer {
    queue: Arc<dyn QueueClient>,
    registry: HandlerRegistry,
    lifecycle: Lifecycle,
    queue_url: String,
    max_concurrency: usize,
    receive_options: ReceiveOptions,
    error_backoff: Duration,
}

impl SqsConsumer {
    pub fn new(queue: Arc<dyn QueueClient>, config: &AwsConfig) -> Self {
        Self {
            queue,
            registry: HandlerRegistry::new(),
            lifecycle: Lifecycle::new(),
            queue_url: config.user_registered_queue_url.clone(),
            max_concurrency: config.effective_max_concurrency(),
            receive_options: ReceiveOptions::from_config(config),
            error_backoff: Duration::from_millis(config.receive_error_backoff_ms),
        }
    }

    #[cfg(feature = "aws")]
    pub async fn connect(config: &AwsConfig) -> Result<Self> {
        let sdk_config = client::load_sdk_config(config).await;
        let queue = client::SdkQueueClient::new(&sdk_config, &config.user_registered_queue_url);
        info!(
            queue_url = %config.user_registered_queue_url,
            region = %config.region,
            max_concurrency = config.effective_max_concurrency(),
            "Created SQS consumer"
        );
        Ok(Self::new(Arc::new(queue), config))
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    async fn drain(&self, semaphore: &Semaphore) {
        self.lifecycle.mark_draining();
        info!(queue_url = %self.queue_url, "Draining SQS consumer");

        // Every task holds one permit until its message is acknowledged.
        let permits = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        match semaphore.acquire_many(permits).await {
            Ok(_all) => {}
            Err(e) => warn!(error = %e, "Worker semaphore closed while draining"),
        }

        self.lifecycle.mark_stopped();
        info!(queue_url = %self.queue_url, "SQS consumer stopped");
    }
}

/// Unwrap the outer envelope and run the inner event through its handler.
///
/// A body that is not an outer envelope is an error, so the message stays
/// on the queue. A detail-type nobody handles counts as processed.
pub async fn handle_message(registry: &HandlerRegistry, message: &QueueMessage) -> Result<()> {
    let body = message.body.as_deref().unwrap_or_default();
    let outer: OuterEnvelope = serde_json::from_str(body).map_err(MessagingError::Envelope)?;

    debug!(
        detail_type = %outer.detail_type,
        source = %outer.source,
        message_id = message.message_id.as_deref().unwrap_or_default(),
        "Received EventBridge event from SQS"
    );

    let Some(handler) = registry.get(&outer.detail_type) else {
        warn!(detail_type = %outer.detail_type, "No handler registered for detail type");
        return Ok(());
    };

    let headers = peek_headers(&outer.detail);
    let inbound = InboundMessage {
        topic: outer.detail_type,
        body: outer.detail.into_bytes(),
        headers,
        broker: BrokerType::Sqs,
    };
    handler.dispatch(&inbound).await
}

async fn process_and_ack(queue: &dyn QueueClient, registry: &HandlerRegistry, message: QueueMessage) {
    let message_id = message.message_id.as_deref().unwrap_or("unknown");

    if let Err(e) = handle_message(registry, &message).await {
        error!(message_id = %message_id, error = %e, "Failed to process SQS message");
        return;
    }

    let Some(receipt_handle) = message.receipt_handle.as_deref() else {
        warn!(message_id = %message_id, "SQS message has no receipt handle, cannot delete");
        return;
    };
    match queue.delete(receipt_handle).await {
        Ok(()) => debug!(message_id = %message_id, "Message deleted from SQS"),
        Err(e) => error!(message_id = %message_id, error = %e, "Failed to delete message from SQS"),
    }
}

#[async_trait]
impl MessageConsumer for SqsConsumer {
    fn register_handler(&mut self, registration: HandlerRegistration) -> Result<()> {
        if self.lifecycle.state() != ConsumerState::Created {
            return Err(MessagingError::Config(
                "handlers must be registered before the consumer starts".to_string(),
            ));
        }
        self.registry.register(registration)
    }

    async fn start(&self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(MessagingError::Config("no topics registered".to_string()));
        }
        let mut shutdown = self.lifecycle.begin()?;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        info!(
            queue_url = %self.queue_url,
            topics = ?self.registry.topics(),
            max_concurrency = self.max_concurrency,
            "Starting SQS consumer"
        );

        let reachable = tokio::select! {
            result = self.queue.check_reachable() => Some(result),
            _ = shutdown.requested() => None,
        };
        match reachable {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!(queue_url = %self.queue_url, error = %e, "SQS queue unreachable");
                self.drain(&semaphore).await;
                return Err(e);
            }
            None => {
                self.drain(&semaphore).await;
                return Ok(());
            }
        }

        self.lifecycle.mark_started();
        info!(queue_url = %self.queue_url, "SQS consumer ready");

        let registry = Arc::new(self.registry.clone());

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                received = self.queue.receive(&self.receive_options) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "Failed to receive messages from SQS");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {}
                        _ = shutdown.requested() => break,
                    }
                    continue;
                }
            };

            for message in messages {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!(error = %e, "Worker semaphore closed");
                        break;
                    }
                };
                let queue = Arc::clone(&self.queue);
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    let _permit = permit;
                    process_and_ack(queue.as_ref(), &registry, message).await;
                });
            }
        }

        info!("SQS consumer polling stopped");
        self.drain(&semaphore).await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("Stopping SQS consumer...");
        self.lifecycle.stop().await;
        Ok(())
    }

    fn state(&self) -> ConsumerState {
        self.lifecycle.state()
    }
}

#[cfg(test)]
mod tests;
