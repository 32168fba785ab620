//! Topic to handler routing.
//!
//! Handlers are a closed set: each consumed event type has one
//! `HandlerRegistration` variant binding the broker-neutral pipeline to its
//! typed payload. The registry is filled once before `start()` and only
//! read afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::envelope::CloudEvent;
use super::pipeline::{self, InboundMessage, MessageContext};
use super::{MessagingError, Result};
use crate::events::UserRegisteredEvent;

/// Business handler for one typed event.
#[async_trait]
pub trait CloudEventHandler<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Topic or bus detail-type this handler claims.
    fn topic(&self) -> &str;

    /// Root span name for each processed message.
    fn operation_name(&self) -> &str;

    async fn handle(&self, ctx: &MessageContext, event: CloudEvent<T>) -> Result<()>;
}

/// A handler bound to its payload type.
#[derive(Clone)]
pub enum HandlerRegistration {
    UserRegistered(Arc<dyn CloudEventHandler<UserRegisteredEvent>>),
}

impl HandlerRegistration {
    pub fn topic(&self) -> &str {
        match self {
            HandlerRegistration::UserRegistered(handler) => handler.topic(),
        }
    }

    pub fn operation_name(&self) -> &str {
        match self {
            HandlerRegistration::UserRegistered(handler) => handler.operation_name(),
        }
    }

    /// Run `message` through the middleware pipeline into the typed handler.
    pub async fn dispatch(&self, message: &InboundMessage) -> Result<()> {
        match self {
            HandlerRegistration::UserRegistered(handler) => {
                pipeline::process(handler.as_ref(), message).await
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("topic", &self.topic())
            .field("operation_name", &self.operation_name())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler, rejecting blank names and duplicate topics.
    pub fn register(&mut self, registration: HandlerRegistration) -> Result<()> {
        let topic = registration.topic().trim().to_string();
        if topic.is_empty() {
            return Err(MessagingError::Config(
                "handler topic must not be empty".to_string(),
            ));
        }
        if registration.operation_name().trim().is_empty() {
            return Err(MessagingError::Config(format!(
                "handler for '{}' has no operation name",
                topic
            )));
        }
        if self.handlers.contains_key(&topic) {
            return Err(MessagingError::Config(format!(
                "a handler is already registered for '{}'",
                topic
            )));
        }

        debug!(topic = %topic, operation = %registration.operation_name(), "Registered handler");
        self.handlers.insert(topic, registration);
        Ok(())
    }

    pub fn get(&self, topic: &str) -> Option<&HandlerRegistration> {
        self.handlers.get(topic)
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
