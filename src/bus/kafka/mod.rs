//! Kafka publisher and consumer.
//!
//! One topic per event kind, keyed by account id so every event for a
//! subject lands on one partition. The adapters sit on two small
//! primitives, [`LogProducer`] and [`LogConsumer`], implemented by
//! rdkafka (`client`, feature `kafka`) and by the in-memory log.
//!
//! Acknowledgment: the consumer commits past every record once its handler
//! returns, whether the handler succeeded or not. Failed records are not
//! redelivered on this path, unlike the SQS consumer.

#[cfg(feature = "kafka")]
pub mod client;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
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
use crate::events::{
    PublishedEvent, StickerAssignedToUserEvent, StickerClaimedEvent, StickerRemovedFromUserEvent,
};

/// Record header carrying the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Delay before polling again after a transient receive error.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Primitives
// ============================================================================

#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Where the broker stored a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Send one record and wait for the broker acknowledgment.
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport>;

    /// Wait for every in-flight record to be acknowledged.
    async fn flush(&self) -> Result<()>;
}

#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Join the group for `topics`. Resolves once the broker is reachable.
    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    /// Next record across all assigned partitions.
    async fn recv(&self) -> Result<ConsumerRecord>;

    /// Mark `offset` on `topic`/`partition` as processed.
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Publisher
// ============================================================================

/// Publishes sticker events to Kafka topics.
///
/// Envelopes use the topic as `type` and `sticker-award` as `source`.
pub struct KafkaPublisher {
    producer: Arc<dyn LogProducer>,
    closed: AtomicBool,
}

impl KafkaPublisher {
    pub fn new(producer: Arc<dyn LogProducer>) -> Self {
        Self {
            producer,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect an rdkafka producer.
    #[cfg(feature = "kafka")]
    pub fn connect(config: &crate::config::KafkaConfig) -> Result<Self> {
        let producer = client::RdKafkaProducer::new(config)?;
        info!(
            brokers = %config.bootstrap_servers(),
            "Connected Kafka producer"
        );
        Ok(Self::new(Arc::new(producer)))
    }

    async fn publish_event<E: PublishedEvent>(&self, event: &E) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Publish("publisher is closed".to_string()));
        }

        let topic = E::TOPIC;
        let key = event.subject_id();
        let span = telemetry::producer_span(BrokerType::Kafka.messaging_system(), topic);

        let result: Result<()> = async {
            let envelope = CloudEvent::wrap(topic, SERVICE_SOURCE, event, telemetry::active_span());
            let payload = serde_json::to_vec(&envelope).map_err(|e| {
                MessagingError::Serialization(format!("failed to serialize cloud event: {}", e))
            })?;

            let mut headers = Headers::new();
            headers.insert(CONTENT_TYPE_HEADER.to_string(), JSON_CONTENT_TYPE.to_string());
            Checkpoint::outbound(BrokerType::Kafka, topic).inject(&mut headers)?;
            telemetry::inject_context(&mut headers);

            let report = self
                .producer
                .send(ProducerRecord {
                    topic: topic.to_string(),
                    key: key.to_string(),
                    payload,
                    headers,
                })
                .await?;

            info!(
                topic = %topic,
                key = %key,
                event_id = %envelope.id,
                partition = report.partition,
                offset = report.offset,
                "Successfully published event"
            );
            Ok(())
        }
        .instrument(span.clone())
        .await;

        if let Err(e) = &result {
            telemetry::record_error(&span, e);
            error!(topic = %topic, key = %key, error = %e, "Failed to publish event");
        }

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, PUBLISH_TOTAL};
            PUBLISH_TOTAL.add(
                1,
                &[
                    metrics::system_attr(BrokerType::Kafka.messaging_system()),
                    metrics::topic_attr(topic),
                    metrics::outcome_attr(metrics::outcome_of(&result)),
                ],
            );
        }

        result
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish_sticker_assigned(&self, event: &StickerAssignedToUserEvent) -> Result<()> {
        self.publish_event(event).await
    }

    async fn publish_sticker_removed(&self, event: &StickerRemovedFromUserEvent) -> Result<()> {
        self.publish_event(event).await
    }

    async fn publish_sticker_claimed(&self, event: &StickerClaimedEvent) -> Result<()> {
        self.publish_event(event).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.producer.flush().await?;
        info!("Kafka producer closed");
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Consumer-group subscriber for registered topics.
///
/// Each assigned (topic, partition) gets one sequential worker, so records
/// of a partition are handled in offset order while partitions proceed in
/// parallel.
pub struct KafkaConsumer {
    consumer: Arc<dyn LogConsumer>,
    registry: HandlerRegistry,
    lifecycle: Lifecycle,
    group_id: String,
    partition_buffer: usize,
}

impl KafkaConsumer {
    pub fn new(
        consumer: Arc<dyn LogConsumer>,
        group_id: impl Into<String>,
        partition_buffer: usize,
    ) -> Self {
        Self {
            consumer,
            registry: HandlerRegistry::new(),
            lifecycle: Lifecycle::new(),
            group_id: group_id.into(),
            partition_buffer: partition_buffer.max(1),
        }
    }

    /// Create an rdkafka consumer-group member.
    #[cfg(feature = "kafka")]
    pub fn connect(config: &crate::config::KafkaConfig) -> Result<Self> {
        let consumer = client::RdKafkaConsumer::new(config)?;
        info!(
            brokers = %config.bootstrap_servers(),
            group_id = %config.group_id,
            "Created Kafka consumer"
        );
        Ok(Self::new(
            Arc::new(consumer),
            config.group_id.clone(),
            config.partition_buffer,
        ))
    }

    fn spawn_worker(&self, registry: &Arc<HandlerRegistry>) -> PartitionWorker {
        let (sender, receiver) = mpsc::channel(self.partition_buffer);
        let handle = tokio::spawn(run_partition(
            Arc::clone(&self.consumer),
            Arc::clone(registry),
            receiver,
        ));
        PartitionWorker { sender, handle }
    }

    async fn drain(&self, workers: HashMap<(String, i32), PartitionWorker>) {
        self.lifecycle.mark_draining();
        info!(partitions = workers.len(), "Draining Kafka consumer");

        let handles: Vec<JoinHandle<()>> = workers
            .into_values()
            .map(|worker| {
                drop(worker.sender);
                worker.handle
            })
            .collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Partition worker failed");
            }
        }

        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "Error closing Kafka consumer");
        }
        self.lifecycle.mark_stopped();
        info!(group_id = %self.group_id, "Kafka consumer stopped");
    }
}

struct PartitionWorker {
    sender: mpsc::Sender<ConsumerRecord>,
    handle: JoinHandle<()>,
}

async fn run_partition(
    consumer: Arc<dyn LogConsumer>,
    registry: Arc<HandlerRegistry>,
    mut records: mpsc::Receiver<ConsumerRecord>,
) {
    while let Some(record) = records.recv().await {
        match registry.get(&record.topic) {
            None => {
                warn!(topic = %record.topic, "No handler registered for topic");
            }
            Some(handler) => {
                let message = InboundMessage {
                    topic: record.topic.clone(),
                    body: record.payload,
                    headers: record.headers,
                    broker: BrokerType::Kafka,
                };
                match handler.dispatch(&message).await {
                    Ok(()) => debug!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Message processed successfully"
                    ),
                    Err(e) => error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Error handling message"
                    ),
                }
            }
        }

        // Committed whatever the handler returned.
        if let Err(e) = consumer.commit(&record.topic, record.partition, record.offset) {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to commit offset"
            );
        }
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
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

        let topics = self.registry.topics();
        info!(group_id = %self.group_id, topics = ?topics, "Starting Kafka consumer");

        let subscribed = tokio::select! {
            result = self.consumer.subscribe(&topics) => Some(result),
            _ = shutdown.requested() => None,
        };
        match subscribed {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!(error = %e, "Failed to subscribe to Kafka topics");
                self.drain(HashMap::new()).await;
                return Err(e);
            }
            None => {
                self.drain(HashMap::new()).await;
                return Ok(());
            }
        }

        self.lifecycle.mark_started();
        info!(group_id = %self.group_id, "Kafka consumer ready");

        let registry = Arc::new(self.registry.clone());
        let mut workers: HashMap<(String, i32), PartitionWorker> = HashMap::new();
        let mut outcome = Ok(());

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                received = self.consumer.recv() => received,
            };

            match received {
                Ok(record) => {
                    let key = (record.topic.clone(), record.partition);
                    let worker = workers
                        .entry(key)
                        .or_insert_with(|| self.spawn_worker(&registry));
                    if worker.sender.send(record).await.is_err() {
                        error!("Partition worker exited unexpectedly");
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Kafka receive failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                        _ = shutdown.requested() => break,
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer failed");
                    outcome = Err(e);
                    break;
                }
            }
        }

        self.drain(workers).await;
        outcome
    }

    async fn stop(&self) -> Result<()> {
        info!("Stopping Kafka consumer...");
        self.lifecycle.stop().await;
        Ok(())
    }

    fn state(&self) -> ConsumerState {
        self.lifecycle.state()
    }
}
