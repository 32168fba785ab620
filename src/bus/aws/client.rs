//! AWS SDK-backed bus and queue primitives.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_eventbridge::types::PutEventsRequestEntry;
use aws_sdk_eventbridge::Client as EventBridgeClient;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use tracing::debug;

use super::{BusEntry, BusEntryResult, EventBusClient, QueueClient, QueueMessage, ReceiveOptions};
use crate::bus::{MessagingError, Result};
use crate::config::AwsConfig;

/// Load shared SDK configuration, honouring the region and endpoint overrides.
pub async fn load_sdk_config(config: &AwsConfig) -> aws_config::SdkConfig {
    let mut builder = aws_config::defaults(BehaviorVersion::latest());

    if !config.region.trim().is_empty() {
        builder = builder.region(aws_config::Region::new(config.region.clone()));
    }

    if let Some(ref endpoint) = config.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }

    builder.load().await
}

pub struct SdkEventBusClient {
    client: EventBridgeClient,
}

impl SdkEventBusClient {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: EventBridgeClient::new(sdk_config),
        }
    }
}

#[async_trait]
impl EventBusClient for SdkEventBusClient {
    async fn put_events(&self, entries: Vec<BusEntry>) -> Result<Vec<BusEntryResult>> {
        let mut request = self.client.put_events();
        for entry in entries {
            request = request.entries(
                PutEventsRequestEntry::builder()
                    .event_bus_name(entry.event_bus_name)
                    .source(entry.source)
                    .detail_type(entry.detail_type)
                    .detail(entry.detail)
                    .build(),
            );
        }

        let output = request.send().await.map_err(|e| {
            MessagingError::Publish(format!(
                "failed to publish event to EventBridge: {}",
                DisplayErrorContext(&e)
            ))
        })?;

        debug!(
            failed_entries = output.failed_entry_count(),
            "EventBridge PutEvents completed"
        );

        Ok(output
            .entries()
            .iter()
            .map(|entry| BusEntryResult {
                event_id: entry.event_id().map(str::to_string),
                error_code: entry.error_code().map(str::to_string),
                error_message: entry.error_message().map(str::to_string),
            })
            .collect())
    }
}

pub struct SdkQueueClient {
    client: SqsClient,
    queue_url: String,
}

impl SdkQueueClient {
    pub fn new(sdk_config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self {
            client: SqsClient::new(sdk_config),
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl QueueClient for SdkQueueClient {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(options.max_messages)
            .wait_time_seconds(options.wait_time_secs)
            .visibility_timeout(options.visibility_timeout_secs)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| MessagingError::Receive(DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .messages()
            .iter()
            .map(|message| QueueMessage {
                message_id: message.message_id().map(str::to_string),
                receipt_handle: message.receipt_handle().map(str::to_string),
                body: message.body().map(str::to_string),
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| {
                MessagingError::Receive(format!(
                    "failed to delete message: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn check_reachable(&self) -> Result<()> {
        self.client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| {
                MessagingError::Connection(format!(
                    "SQS queue {} unreachable: {}",
                    self.queue_url,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}
