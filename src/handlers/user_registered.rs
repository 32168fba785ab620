//! Welcome sticker on user registration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::WelcomeStickerAssigner;
use crate::bus::{
    CloudEvent, CloudEventHandler, HandlerRegistration, MessageContext, MessagingError, Result,
    TOPIC_USER_REGISTERED,
};
use crate::events::UserRegisteredEvent;

/// Root span name for each processed registration.
pub const USER_REGISTERED_OPERATION: &str = "process users.userRegistered.v1";

/// `eventName` user management stamps on registrations.
pub const EXPECTED_EVENT_NAME: &str = "users.userRegistered.v1";

pub struct UserRegisteredHandler {
    assigner: Arc<dyn WelcomeStickerAssigner>,
}

impl UserRegisteredHandler {
    pub fn new(assigner: Arc<dyn WelcomeStickerAssigner>) -> Self {
        Self { assigner }
    }

    /// Bind a handler around `assigner` for consumer registration.
    pub fn registration(assigner: Arc<dyn WelcomeStickerAssigner>) -> HandlerRegistration {
        HandlerRegistration::UserRegistered(Arc::new(Self::new(assigner)))
    }

    fn failure(&self, message: String) -> MessagingError {
        MessagingError::Handler {
            operation: USER_REGISTERED_OPERATION.to_string(),
            message,
        }
    }
}

#[async_trait]
impl CloudEventHandler<UserRegisteredEvent> for UserRegisteredHandler {
    fn topic(&self) -> &str {
        TOPIC_USER_REGISTERED
    }

    fn operation_name(&self) -> &str {
        USER_REGISTERED_OPERATION
    }

    async fn handle(&self, ctx: &MessageContext, event: CloudEvent<UserRegisteredEvent>) -> Result<()> {
        let event_id = ctx.event_id.as_str();
        let event_type = event.event_type.as_str();
        let data = &event.data;

        info!(
            account_id = %data.account_id,
            event_id = %event_id,
            event_type = %event_type,
            "Successfully parsed CloudEvent"
        );

        if data.account_id.is_empty() {
            return Err(self.failure("accountId is required in user registered event".to_string()));
        }

        // Tolerated: older producers stamp other names on the same topic.
        if data.event_name != EXPECTED_EVENT_NAME {
            warn!(
                expected = EXPECTED_EVENT_NAME,
                actual = %data.event_name,
                "Unexpected event name"
            );
        }

        info!(
            account_id = %data.account_id,
            event_version = %data.event_version,
            "Assigning welcome sticker to new user"
        );

        self.assigner
            .assign_welcome_sticker(&data.account_id)
            .await
            .map_err(|e| {
                self.failure(format!(
                    "failed to assign welcome sticker to user {}: {}",
                    data.account_id, e
                ))
            })?;

        info!(account_id = %data.account_id, "Successfully assigned welcome sticker");
        Ok(())
    }
}
