//! Provider selection.
//!
//! Builds the configured broker family behind the broker-neutral traits.
//! Configuration is validated before any client is created, so a missing
//! bus name or queue URL fails startup instead of the first publish.

use tracing::{error, info};

use super::{EventPublisher, MessageConsumer, Result};
use crate::config::{MessagingConfig, MessagingProvider};

#[cfg(any(not(feature = "kafka"), not(feature = "aws")))]
use super::MessagingError;

/// Create the publisher for `config.provider`.
pub async fn new_publisher(config: &MessagingConfig) -> Result<Box<dyn EventPublisher>> {
    config.validate_publisher().inspect_err(|e| {
        error!(provider = %config.provider, error = %e, "Invalid publisher configuration");
    })?;
    info!(provider = %config.provider, "Creating event publisher");

    match config.provider {
        #[cfg(feature = "kafka")]
        MessagingProvider::Kafka => Ok(Box::new(super::KafkaPublisher::connect(&config.kafka)?)),
        #[cfg(not(feature = "kafka"))]
        MessagingProvider::Kafka => Err(missing_feature("kafka")),

        #[cfg(feature = "aws")]
        MessagingProvider::Aws => Ok(Box::new(
            super::EventBridgePublisher::connect(&config.aws).await?,
        )),
        #[cfg(not(feature = "aws"))]
        MessagingProvider::Aws => Err(missing_feature("aws")),
    }
}

/// Create the consumer for `config.provider`. Handlers are registered afterwards.
pub async fn new_consumer(config: &MessagingConfig) -> Result<Box<dyn MessageConsumer>> {
    config.validate_consumer().inspect_err(|e| {
        error!(provider = %config.provider, error = %e, "Invalid consumer configuration");
    })?;
    info!(provider = %config.provider, "Creating message consumer");

    match config.provider {
        #[cfg(feature = "kafka")]
        MessagingProvider::Kafka => Ok(Box::new(super::KafkaConsumer::connect(&config.kafka)?)),
        #[cfg(not(feature = "kafka"))]
        MessagingProvider::Kafka => Err(missing_feature("kafka")),

        #[cfg(feature = "aws")]
        MessagingProvider::Aws => Ok(Box::new(super::SqsConsumer::connect(&config.aws).await?)),
        #[cfg(not(feature = "aws"))]
        MessagingProvider::Aws => Err(missing_feature("aws")),
    }
}

#[cfg(any(not(feature = "kafka"), not(feature = "aws")))]
fn missing_feature(feature: &str) -> MessagingError {
    error!(feature, "Messaging provider requested but its feature is not enabled");
    MessagingError::Config(format!(
        "{feature} support requires the '{feature}' feature. Rebuild with --features {feature}"
    ))
}
