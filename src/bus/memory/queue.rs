use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::bus::aws::{
    BusEntry, BusEntryResult, EventBusClient, OuterEnvelope, QueueClient, QueueMessage,
    ReceiveOptions,
};
use crate::bus::{MessagingError, Result};

/// Region stamped on outer envelopes produced by [`MemoryBus`].
pub const MEMORY_REGION: &str = "us-east-1";
/// Account stamped on outer envelopes produced by [`MemoryBus`].
pub const MEMORY_ACCOUNT: &str = "000000000000";

#[derive(Debug)]
struct QueuedMessage {
    id: String,
    body: String,
    receipt_handle: Option<String>,
    visible_at: Option<Instant>,
    receive_count: u32,
}

struct QueueState {
    url: String,
    messages: Mutex<Vec<QueuedMessage>>,
    arrived: Notify,
    failed_receives: AtomicUsize,
}

/// A queue with long polling, visibility timeouts and receipt handles.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<QueueState>,
}

impl MemoryQueue {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            state: Arc::new(QueueState {
                url: url.into(),
                messages: Mutex::new(Vec::new()),
                arrived: Notify::new(),
                failed_receives: AtomicUsize::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.state.url
    }

    /// Enqueue a raw body, returning its message id.
    pub async fn send(&self, body: impl Into<String>) -> String {
        let id = Uuid::new_v4().to_string();
        self.state.messages.lock().await.push(QueuedMessage {
            id: id.clone(),
            body: body.into(),
            receipt_handle: None,
            visible_at: None,
            receive_count: 0,
        });
        self.state.arrived.notify_waiters();
        id
    }

    /// Messages not yet deleted, visible or not.
    pub async fn depth(&self) -> usize {
        self.state.messages.lock().await.len()
    }

    /// Messages currently hidden by a visibility timeout.
    pub async fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.state
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.visible_at.is_some_and(|at| at > now))
            .count()
    }

    /// How often the message with `message_id` has been received.
    pub async fn receive_count(&self, message_id: &str) -> Option<u32> {
        self.state
            .messages
            .lock()
            .await
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.receive_count)
    }

    /// Make the next `count` receives fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.state.failed_receives.store(count, Ordering::SeqCst);
    }

    /// Hand out up to `max` visible messages and hide them for `visibility`.
    ///
    /// Otherwise returns the instant the next hidden message reappears.
    async fn take_visible(&self, max: usize, visibility: Duration) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut messages = self.state.messages.lock().await;
        let mut received = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for message in messages.iter_mut() {
            match message.visible_at {
                Some(at) if at > now => {
                    next_visible = Some(next_visible.map_or(at, |next| next.min(at)));
                }
                _ if received.len() < max => {
                    let receipt = Uuid::new_v4().to_string();
                    message.receipt_handle = Some(receipt.clone());
                    message.visible_at = Some(now + visibility);
                    message.receive_count += 1;
                    received.push(QueueMessage {
                        message_id: Some(message.id.clone()),
                        receipt_handle: Some(receipt),
                        body: Some(message.body.clone()),
                    });
                }
                _ => {}
            }
        }
        (received, next_visible)
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn receive(&self, options: &ReceiveOptions) -> Result<Vec<QueueMessage>> {
        if self
            .state
            .failed_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MessagingError::Receive(format!(
                "queue {} unavailable",
                self.state.url
            )));
        }

        let max = options.max_messages.max(1) as usize;
        let visibility = Duration::from_secs(options.visibility_timeout_secs.max(0) as u64);
        let deadline = Instant::now() + Duration::from_secs(options.wait_time_secs.max(0) as u64);

        loop {
            let arrived = self.state.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let (received, next_visible) = self.take_visible(max, visibility).await;
            if !received.is_empty() {
                return Ok(received);
            }

            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout_at(wake, arrived).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let mut messages = self.state.messages.lock().await;
        let position = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                MessagingError::Receive(format!("receipt handle is invalid: {}", receipt_handle))
            })?;
        let removed = messages.remove(position);
        debug!(queue = %self.state.url, message_id = %removed.id, "Deleted message");
        Ok(())
    }

    async fn check_reachable(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct BusState {
    name: String,
    rules: RwLock<HashMap<String, Vec<MemoryQueue>>>,
    published: RwLock<Vec<OuterEnvelope>>,
    failures: Mutex<VecDeque<(String, String)>>,
}

/// An event bus routing entries by detail-type to subscribed queues.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<BusState>,
}

impl MemoryBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BusState {
                name: name.into(),
                ..Default::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Deliver every event with `detail_type` to `queue`.
    pub async fn route(&self, detail_type: impl Into<String>, queue: MemoryQueue) {
        self.state
            .rules
            .write()
            .await
            .entry(detail_type.into())
            .or_default()
            .push(queue);
    }

    /// Reject the next entry with `code` and `message`.
    pub async fn fail_next(&self, code: impl Into<String>, message: impl Into<String>) {
        self.state
            .failures
            .lock()
            .await
            .push_back((code.into(), message.into()));
    }

    /// Every accepted event, in put order.
    pub async fn published(&self) -> Vec<OuterEnvelope> {
        self.state.published.read().await.clone()
    }

    async fn accept(&self, entry: BusEntry) -> BusEntryResult {
        if entry.event_bus_name != self.state.name {
            return BusEntryResult {
                error_code: Some("ResourceNotFoundException".to_string()),
                error_message: Some(format!("Event bus {} does not exist.", entry.event_bus_name)),
                ..Default::default()
            };
        }

        if let Some((code, message)) = self.state.failures.lock().await.pop_front() {
            return BusEntryResult {
                error_code: Some(code),
                error_message: Some(message),
                ..Default::default()
            };
        }

        let outer = OuterEnvelope {
            version: "0".to_string(),
            id: Uuid::new_v4().to_string(),
            detail_type: entry.detail_type,
            source: entry.source,
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            region: MEMORY_REGION.to_string(),
            resources: Vec::new(),
            detail: entry.detail,
            account: MEMORY_ACCOUNT.to_string(),
            metadata: None,
        };

        let targets = self
            .state
            .rules
            .read()
            .await
            .get(&outer.detail_type)
            .cloned()
            .unwrap_or_default();
        if !targets.is_empty() {
            match serde_json::to_string(&outer) {
                Ok(body) => {
                    for queue in &targets {
                        queue.send(body.clone()).await;
                    }
                }
                Err(e) => {
                    return BusEntryResult {
                        error_code: Some("InternalException".to_string()),
                        error_message: Some(e.to_string()),
                        ..Default::default()
                    };
                }
            }
        }

        debug!(
            bus = %self.state.name,
            detail_type = %outer.detail_type,
            targets = targets.len(),
            "Accepted event"
        );
        let event_id = outer.id.clone();
        self.state.published.write().await.push(outer);

        BusEntryResult {
            event_id: Some(event_id),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EventBusClient for MemoryBus {
    async fn put_events(&self, entries: Vec<BusEntry>) -> Result<Vec<BusEntryResult>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.accept(entry).await);
        }
        Ok(results)
    }
}
