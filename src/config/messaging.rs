//! Messaging provider configuration types.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::bus::{MessagingError, Result};

/// Fallbacks applied when a queue setting is zero or negative.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: i32 = 30;
pub const DEFAULT_WAIT_TIME_SECS: i32 = 20;

/// Broker family discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum MessagingProvider {
    /// Partitioned log (Kafka).
    #[default]
    Kafka,
    /// EventBridge bus publishing, SQS queue consumption.
    Aws,
}

impl MessagingProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagingProvider::Kafka => "kafka",
            MessagingProvider::Aws => "aws",
        }
    }
}

impl fmt::Display for MessagingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessagingProvider {
    type Err = MessagingError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "kafka" => Ok(MessagingProvider::Kafka),
            "aws" => Ok(MessagingProvider::Aws),
            other => Err(MessagingError::Config(format!(
                "unsupported messaging provider: {} (supported: kafka, aws)",
                other
            ))),
        }
    }
}

impl TryFrom<String> for MessagingProvider {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Kafka connection and client tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub group_id: String,
    /// SASL PLAIN over SSL when credentials are set, plain SSL otherwise.
    pub enable_tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub producer_timeout_ms: u64,
    pub producer_retries: u32,
    pub producer_batch_size: u32,
    /// Required acknowledgments: 0, 1 or -1 (all).
    pub require_acks: i16,
    pub enable_idempotent: bool,
    /// Records buffered per partition worker before the receive loop waits.
    pub partition_buffer: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            group_id: "sticker-award-service".to_string(),
            enable_tls: false,
            username: None,
            password: None,
            producer_timeout_ms: 5000,
            producer_retries: 3,
            producer_batch_size: 16384,
            require_acks: 1,
            enable_idempotent: true,
            partition_buffer: 64,
        }
    }
}

impl KafkaConfig {
    /// Comma-joined broker list with blanks removed.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers
            .iter()
            .map(|b| b.trim())
            .filter(|b| !b.is_empty())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// librdkafka `acks` value. Idempotence requires acknowledgment from all replicas.
    pub fn acks(&self) -> &'static str {
        if self.enable_idempotent {
            return "all";
        }
        match self.require_acks {
            0 => "0",
            1 => "1",
            _ => "all",
        }
    }
}

/// AWS EventBridge + SQS settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: String,
    /// Endpoint override, e.g. LocalStack.
    pub endpoint_url: Option<String>,
    pub event_bus_name: String,
    pub user_registered_queue_url: String,
    pub max_concurrency: i32,
    pub visibility_timeout_secs: i32,
    pub wait_time_secs: i32,
    pub receive_error_backoff_ms: u64,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            event_bus_name: String::new(),
            user_registered_queue_url: String::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY as i32,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            wait_time_secs: DEFAULT_WAIT_TIME_SECS,
            receive_error_backoff_ms: 5000,
        }
    }
}

impl AwsConfig {
    pub fn effective_max_concurrency(&self) -> usize {
        if self.max_concurrency <= 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            self.max_concurrency as usize
        }
    }

    pub fn effective_visibility_timeout_secs(&self) -> i32 {
        if self.visibility_timeout_secs <= 0 {
            DEFAULT_VISIBILITY_TIMEOUT_SECS
        } else {
            self.visibility_timeout_secs
        }
    }

    pub fn effective_wait_time_secs(&self) -> i32 {
        if self.wait_time_secs <= 0 {
            DEFAULT_WAIT_TIME_SECS
        } else {
            self.wait_time_secs
        }
    }
}

/// Everything the provider factory needs.
#[derive(Debug, Clone, Default)]
pub struct MessagingConfig {
    pub provider: MessagingProvider,
    pub kafka: KafkaConfig,
    pub aws: AwsConfig,
}

impl MessagingConfig {
    pub fn kafka(kafka: KafkaConfig) -> Self {
        Self {
            provider: MessagingProvider::Kafka,
            kafka,
            aws: AwsConfig::default(),
        }
    }

    pub fn aws(aws: AwsConfig) -> Self {
        Self {
            provider: MessagingProvider::Aws,
            kafka: KafkaConfig::default(),
            aws,
        }
    }

    /// Check the settings a publisher needs.
    pub fn validate_publisher(&self) -> Result<()> {
        match self.provider {
            MessagingProvider::Kafka => self.require_brokers(),
            MessagingProvider::Aws => {
                self.require_region()?;
                if self.aws.event_bus_name.trim().is_empty() {
                    return Err(MessagingError::Config(
                        "EventBridge bus name is required but not configured (EVENT_BUS_NAME)"
                            .to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Check the settings a consumer needs.
    pub fn validate_consumer(&self) -> Result<()> {
        match self.provider {
            MessagingProvider::Kafka => {
                self.require_brokers()?;
                if self.kafka.group_id.trim().is_empty() {
                    return Err(MessagingError::Config(
                        "Kafka consumer group id is required".to_string(),
                    ));
                }
                Ok(())
            }
            MessagingProvider::Aws => {
                if self.aws.user_registered_queue_url.trim().is_empty() {
                    return Err(MessagingError::Config(
                        "SQS queue URL is required but not configured (USER_REGISTERED_QUEUE_URL)"
                            .to_string(),
                    ));
                }
                self.require_region()
            }
        }
    }

    fn require_brokers(&self) -> Result<()> {
        if self.kafka.bootstrap_servers().is_empty() {
            return Err(MessagingError::Config(
                "at least one Kafka broker is required (KAFKA_BROKERS)".to_string(),
            ));
        }
        Ok(())
    }

    fn require_region(&self) -> Result<()> {
        if self.aws.region.trim().is_empty() {
            return Err(MessagingError::Config(
                "AWS region is required but not configured".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("kafka".parse::<MessagingProvider>().unwrap(), MessagingProvider::Kafka);
        assert_eq!("aws".parse::<MessagingProvider>().unwrap(), MessagingProvider::Aws);

        let err = "rabbitmq".parse::<MessagingProvider>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: unsupported messaging provider: rabbitmq (supported: kafka, aws)"
        );
    }

    #[test]
    fn test_kafka_defaults() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers(), "localhost:9092");
        assert_eq!(config.group_id, "sticker-award-service");
        assert_eq!(config.acks(), "all");
    }

    #[test]
    fn test_acks_without_idempotence() {
        let mut config = KafkaConfig {
            enable_idempotent: false,
            ..Default::default()
        };
        assert_eq!(config.acks(), "1");
        config.require_acks = 0;
        assert_eq!(config.acks(), "0");
        config.require_acks = -1;
        assert_eq!(config.acks(), "all");
    }

    #[test]
    fn test_queue_fallbacks() {
        let config = AwsConfig {
            max_concurrency: 0,
            visibility_timeout_secs: -5,
            wait_time_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.effective_max_concurrency(), 10);
        assert_eq!(config.effective_visibility_timeout_secs(), 30);
        assert_eq!(config.effective_wait_time_secs(), 20);
    }

    #[test]
    fn test_blank_brokers_rejected() {
        let config = MessagingConfig::kafka(KafkaConfig {
            brokers: vec![" ".to_string(), String::new()],
            ..Default::default()
        });
        assert!(matches!(config.validate_publisher(), Err(MessagingError::Config(_))));
    }

    #[test]
    fn test_aws_requirements() {
        let mut config = MessagingConfig::aws(AwsConfig::default());
        assert!(config.validate_publisher().is_err());
        assert!(config.validate_consumer().is_err());

        config.aws.event_bus_name = "stickerlandia".to_string();
        config.aws.user_registered_queue_url =
            "https://sqs.us-east-1.amazonaws.com/000000000000/user-registered".to_string();
        assert!(config.validate_publisher().is_ok());
        assert!(config.validate_consumer().is_ok());

        config.aws.region = String::new();
        assert!(config.validate_consumer().is_err());
    }
}
