//! rdkafka-backed log primitives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers as _, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::debug;

use super::{ConsumerRecord, DeliveryReport, LogConsumer, LogProducer, ProducerRecord};
use crate::bus::{Headers, MessagingError, Result};
use crate::config::KafkaConfig;

pub const PRODUCER_CLIENT_ID: &str = "sticker-award-producer";
pub const CONSUMER_CLIENT_ID: &str = "sticker-award-consumer";

/// Bound on the broker metadata round-trip used as the readiness check.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a ClientConfig for producers.
pub fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("client.id", PRODUCER_CLIENT_ID)
        .set("acks", config.acks())
        .set("retries", config.producer_retries.to_string())
        .set("message.timeout.ms", config.producer_timeout_ms.to_string())
        .set("compression.type", "snappy")
        .set("batch.size", config.producer_batch_size.to_string())
        .set("linger.ms", "100")
        .set("enable.idempotence", config.enable_idempotent.to_string());

    apply_security_config(config, &mut client);
    client
}

/// Build a ClientConfig for consumers.
pub fn consumer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("group.id", &config.group_id)
        .set("client.id", CONSUMER_CLIENT_ID)
        .set("partition.assignment.strategy", "roundrobin")
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false");

    apply_security_config(config, &mut client);
    client
}

/// Apply security settings to a ClientConfig.
fn apply_security_config(config: &KafkaConfig, client: &mut ClientConfig) {
    match (&config.username, &config.password) {
        (Some(username), Some(password)) => {
            let protocol = if config.enable_tls {
                "SASL_SSL"
            } else {
                "SASL_PLAINTEXT"
            };
            client
                .set("security.protocol", protocol)
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }
        _ if config.enable_tls => {
            client.set("security.protocol", "SSL");
        }
        _ => {}
    }
}

pub struct RdKafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl RdKafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = producer_config(config).create().map_err(|e| {
            MessagingError::Connection(format!("Failed to create Kafka producer: {}", e))
        })?;
        Ok(Self {
            producer,
            timeout: Duration::from_millis(config.producer_timeout_ms),
        })
    }
}

#[async_trait]
impl LogProducer for RdKafkaProducer {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for (key, value) in &record.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }

        let future_record = FutureRecord::to(&record.topic)
            .key(record.key.as_str())
            .payload(record.payload.as_slice())
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(future_record, self.timeout)
            .await
            .map_err(|(e, _)| {
                MessagingError::Publish(format!(
                    "failed to publish event to topic {}: {}",
                    record.topic, e
                ))
            })?;

        Ok(DeliveryReport { partition, offset })
    }

    async fn flush(&self) -> Result<()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| MessagingError::Publish(format!("flush task failed: {}", e)))?
            .map_err(|e| MessagingError::Publish(format!("failed to flush producer: {}", e)))
    }
}

pub struct RdKafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

impl RdKafkaConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = consumer_config(config).create().map_err(|e| {
            MessagingError::Connection(format!("Failed to create Kafka consumer: {}", e))
        })?;
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

#[async_trait]
impl LogConsumer for RdKafkaConsumer {
    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topic_refs).map_err(|e| {
            MessagingError::Connection(format!("Failed to subscribe to topics: {}", e))
        })?;

        // The group join itself happens while polling; a metadata round-trip
        // confirms the brokers are reachable before reporting ready.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, METADATA_TIMEOUT))
            .await
            .map_err(|e| MessagingError::Connection(format!("metadata task failed: {}", e)))?
            .map_err(|e| MessagingError::Connection(format!("Kafka brokers unreachable: {}", e)))?;

        debug!(topics = ?topics, "Subscribed to Kafka topics");
        Ok(())
    }

    async fn recv(&self) -> Result<ConsumerRecord> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|e| MessagingError::Receive(e.to_string()))?;

        let headers: Headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        let value = header.value?;
                        Some((
                            header.key.to_string(),
                            String::from_utf8_lossy(value).into_owned(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ConsumerRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            headers,
        })
    }

    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| MessagingError::Receive(format!("invalid offset: {}", e)))?;
        self.consumer
            .commit(&list, CommitMode::Async)
            .map_err(|e| MessagingError::Receive(format!("failed to commit offset: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_config() {
        let config = KafkaConfig {
            brokers: vec!["broker-1:9092".to_string(), "broker-2:9092".to_string()],
            ..Default::default()
        };
        let client = producer_config(&config);

        assert_eq!(client.get("bootstrap.servers"), Some("broker-1:9092,broker-2:9092"));
        assert_eq!(client.get("client.id"), Some(PRODUCER_CLIENT_ID));
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("compression.type"), Some("snappy"));
        assert_eq!(client.get("retries"), Some("3"));
        assert!(client.get("security.protocol").is_none());
    }

    #[test]
    fn test_consumer_config() {
        let client = consumer_config(&KafkaConfig::default());

        assert_eq!(client.get("group.id"), Some("sticker-award-service"));
        assert_eq!(client.get("enable.auto.commit"), Some("false"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("partition.assignment.strategy"), Some("roundrobin"));
    }

    #[test]
    fn test_sasl_config() {
        let config = KafkaConfig {
            enable_tls: true,
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            ..Default::default()
        };
        let client = producer_config(&config);

        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(client.get("sasl.username"), Some("user"));
    }

    #[test]
    fn test_tls_without_credentials() {
        let config = KafkaConfig {
            enable_tls: true,
            ..Default::default()
        };
        assert_eq!(consumer_config(&config).get("security.protocol"), Some("SSL"));
    }
}
