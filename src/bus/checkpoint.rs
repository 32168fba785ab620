//! Data-streams checkpoints.
//!
//! A checkpoint marks a message crossing a service boundary. The outbound
//! checkpoint travels with the message as a header; the inbound side reads
//! it back to compute produce-to-consume lag. Both are best effort: a
//! missing or corrupt header never affects delivery.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Headers, MessagingError, Result};

/// Header carrying the producer checkpoint (base64 JSON).
pub const CHECKPOINT_HEADER: &str = "x-sticker-checkpoint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Broker family a message travelled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    Kafka,
    Eventbridge,
    Sqs,
    Memory,
}

impl BrokerType {
    /// Value of the `messaging.system` span attribute.
    pub fn messaging_system(&self) -> &'static str {
        match self {
            BrokerType::Kafka => "kafka",
            BrokerType::Eventbridge => "aws_eventbridge",
            BrokerType::Sqs => "aws_sqs",
            BrokerType::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub direction: Direction,
    #[serde(rename = "type")]
    pub broker: BrokerType,
    pub topic: String,
    pub produced_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Checkpoint for a message about to leave this service.
    pub fn outbound(broker: BrokerType, topic: impl Into<String>) -> Self {
        Self {
            direction: Direction::Out,
            broker,
            topic: topic.into(),
            produced_at: Utc::now(),
        }
    }

    /// Write this checkpoint into `headers` and record it.
    pub fn inject(&self, headers: &mut Headers) -> Result<()> {
        let json =
            serde_json::to_vec(self).map_err(|e| MessagingError::Serialization(e.to_string()))?;
        headers.insert(CHECKPOINT_HEADER.to_string(), STANDARD.encode(json));
        self.record();
        Ok(())
    }

    /// Read a producer checkpoint from `headers`, if one is present and decodes.
    pub fn extract(headers: &Headers) -> Option<Self> {
        let encoded = headers.get(CHECKPOINT_HEADER)?;
        let bytes = match STANDARD.decode(encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "Ignoring undecodable checkpoint header");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                debug!(error = %e, "Ignoring malformed checkpoint header");
                None
            }
        }
    }

    fn record(&self) {
        debug!(
            direction = self.direction.as_str(),
            system = self.broker.messaging_system(),
            topic = %self.topic,
            "Data streams checkpoint"
        );

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{self, CHECKPOINT_TOTAL};
            CHECKPOINT_TOTAL.add(
                1,
                &[
                    metrics::direction_attr(self.direction.as_str()),
                    metrics::system_attr(self.broker.messaging_system()),
                    metrics::topic_attr(&self.topic),
                ],
            );
        }
    }
}

/// Record the inbound checkpoint for a received message.
///
/// Returns the produce-to-consume lag when the producer left a checkpoint.
pub fn record_inbound(broker: BrokerType, topic: &str, headers: &Headers) -> Option<chrono::Duration> {
    let inbound = Checkpoint {
        direction: Direction::In,
        broker,
        topic: topic.to_string(),
        produced_at: Utc::now(),
    };
    inbound.record();

    let produced = Checkpoint::extract(headers)?;
    let lag = inbound.produced_at - produced.produced_at;
    debug!(topic = %topic, lag_ms = lag.num_milliseconds(), "Pipeline lag");

    #[cfg(feature = "otel")]
    {
        use crate::utils::metrics::{self, PIPELINE_LAG};
        let seconds = lag.num_milliseconds().max(0) as f64 / 1000.0;
        PIPELINE_LAG.record(
            seconds,
            &[
                metrics::system_attr(broker.messaging_system()),
                metrics::topic_attr(topic),
            ],
        );
    }

    Some(lag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_then_extract() {
        let checkpoint = Checkpoint::outbound(BrokerType::Kafka, "stickers.stickerAssignedToUser.v1");
        let mut headers = Headers::new();
        checkpoint.inject(&mut headers).unwrap();

        let extracted = Checkpoint::extract(&headers).unwrap();
        assert_eq!(extracted, checkpoint);
    }

    #[test]
    fn test_wire_format_is_base64_json() {
        let checkpoint = Checkpoint::outbound(BrokerType::Eventbridge, "sticker.assigned");
        let mut headers = Headers::new();
        checkpoint.inject(&mut headers).unwrap();

        let bytes = STANDARD.decode(&headers[CHECKPOINT_HEADER]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["direction"], "out");
        assert_eq!(value["type"], "eventbridge");
        assert_eq!(value["topic"], "sticker.assigned");
    }

    #[test]
    fn test_corrupt_header_is_ignored() {
        let mut headers = Headers::new();
        headers.insert(CHECKPOINT_HEADER.to_string(), "%%%not-base64".to_string());
        assert!(Checkpoint::extract(&headers).is_none());

        headers.insert(CHECKPOINT_HEADER.to_string(), STANDARD.encode(b"{oops"));
        assert!(Checkpoint::extract(&headers).is_none());
    }

    #[test]
    fn test_inbound_without_producer_checkpoint() {
        assert!(record_inbound(BrokerType::Sqs, "users.userRegistered.v1", &Headers::new()).is_none());
    }

    #[test]
    fn test_inbound_reports_lag() {
        let mut produced = Checkpoint::outbound(BrokerType::Kafka, "t");
        produced.produced_at = Utc::now() - chrono::Duration::seconds(2);
        let mut headers = Headers::new();
        produced.inject(&mut headers).unwrap();

        let lag = record_inbound(BrokerType::Kafka, "t", &headers).unwrap();
        assert!(lag >= chrono::Duration::seconds(2));
    }

    #[test]
    fn test_messaging_system_names() {
        assert_eq!(BrokerType::Kafka.messaging_system(), "kafka");
        assert_eq!(BrokerType::Eventbridge.messaging_system(), "aws_eventbridge");
        assert_eq!(BrokerType::Sqs.messaging_system(), "aws_sqs");
    }
}
