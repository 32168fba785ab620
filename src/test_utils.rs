//! Test utilities and mock implementations.
//!
//! Recording doubles for the handler and assigner seams, usable from unit
//! tests and from the integration tests under `tests/`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::bus::{CloudEvent, CloudEventHandler, MessageContext, MessagingError, Result};
use crate::events::UserRegisteredEvent;
use crate::handlers::{AssignError, WelcomeStickerAssigner};

/// Assigner that records every account id it is called with.
#[derive(Default)]
pub struct RecordingAssigner {
    calls: RwLock<Vec<String>>,
    fail_with: RwLock<Option<String>>,
}

impl RecordingAssigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every later call with `message`.
    pub async fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.write().await = Some(message.into());
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl WelcomeStickerAssigner for RecordingAssigner {
    async fn assign_welcome_sticker(&self, account_id: &str) -> std::result::Result<(), AssignError> {
        self.calls.write().await.push(account_id.to_string());
        match self.fail_with.read().await.as_ref() {
            Some(message) => Err(AssignError::Other(message.clone())),
            None => Ok(()),
        }
    }
}

/// Handler for `UserRegisteredEvent` that records deliveries.
///
/// Can fail a fixed number of deliveries and hold each delivery for a
/// while, tracking the highest number of deliveries in flight at once.
pub struct RecordingHandler {
    topic: String,
    operation: String,
    seen: RwLock<Vec<(String, UserRegisteredEvent)>>,
    failures: AtomicUsize,
    hold: Option<Duration>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            operation: format!("process {}", topic),
            topic,
            seen: RwLock::new(Vec::new()),
            failures: AtomicUsize::new(0),
            hold: None,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Fail the first `count` deliveries.
    pub fn failing(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    /// Sleep for `hold` inside every delivery.
    pub fn holding(mut self, hold: Duration) -> Self {
        self.hold = Some(hold);
        self
    }

    /// Event ids and payloads in delivery order.
    pub async fn seen(&self) -> Vec<(String, UserRegisteredEvent)> {
        self.seen.read().await.clone()
    }

    pub async fn account_ids(&self) -> Vec<String> {
        self.seen
            .read()
            .await
            .iter()
            .map(|(_, event)| event.account_id.clone())
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudEventHandler<UserRegisteredEvent> for RecordingHandler {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn operation_name(&self) -> &str {
        &self.operation
    }

    async fn handle(&self, ctx: &MessageContext, event: CloudEvent<UserRegisteredEvent>) -> Result<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        }
        self.seen
            .write()
            .await
            .push((ctx.event_id.clone(), event.data));
        self.active.fetch_sub(1, Ordering::SeqCst);

        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(MessagingError::Handler {
                operation: self.operation.clone(),
                message: "simulated handler failure".to_string(),
            });
        }
        Ok(())
    }
}
