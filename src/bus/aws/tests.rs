use super::*;
use std::future::Future;

use chrono::Utc;
use serde_json::json;

use crate::bus::checkpoint::CHECKPOINT_HEADER;
use crate::bus::memory::{MemoryBus, MemoryQueue};
use crate::bus::TOPIC_USER_REGISTERED;
use crate::events::UserRegisteredEvent;
use crate::test_utils::RecordingHandler;

const BUS: &str = "stickerlandia";
const QUEUE_URL: &str = "memory://user-registered";

fn consumer_config(max_concurrency: i32) -> AwsConfig {
    AwsConfig {
        user_registered_queue_url: QUEUE_URL.to_string(),
        max_concurrency,
        wait_time_secs: 1,
        visibility_timeout_secs: 30,
        receive_error_backoff_ms: 5000,
        ..Default::default()
    }
}

fn outer_body(detail_type: &str, account_id: &str) -> String {
    let inner = CloudEvent::wrap(
        TOPIC_USER_REGISTERED,
        "user-management",
        UserRegisteredEvent {
            event_name: TOPIC_USER_REGISTERED.to_string(),
            event_version: "v1".to_string(),
            account_id: account_id.to_string(),
        },
        None,
    );
    serde_json::to_string(&OuterEnvelope {
        version: "0".to_string(),
        id: uuid::Uuid::new_v4().to_string(),
        detail_type: detail_type.to_string(),
        source: "user-management".to_string(),
        detail: serde_json::to_string(&inner).unwrap(),
        ..Default::default()
    })
    .unwrap()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

fn sqs_consumer(
    queue: &MemoryQueue,
    max_concurrency: i32,
    handler: Arc<RecordingHandler>,
) -> Arc<SqsConsumer> {
    let mut consumer = SqsConsumer::new(Arc::new(queue.clone()), &consumer_config(max_concurrency));
    consumer
        .register_handler(HandlerRegistration::UserRegistered(handler))
        .unwrap();
    Arc::new(consumer)
}

fn run(consumer: &Arc<SqsConsumer>) -> tokio::task::JoinHandle<Result<()>> {
    let consumer = Arc::clone(consumer);
    tokio::spawn(async move { consumer.start().await })
}

// ============================================================================
// Outer envelope
// ============================================================================

#[test]
fn test_outer_envelope_wire_shape() {
    let outer = OuterEnvelope {
        version: "0".to_string(),
        id: "abc".to_string(),
        detail_type: "sticker.assigned".to_string(),
        source: "sticker-award".to_string(),
        time: "2025-06-01T12:00:00Z".to_string(),
        region: "us-east-1".to_string(),
        resources: vec![],
        detail: r#"{"specversion":"1.0"}"#.to_string(),
        account: "000000000000".to_string(),
        metadata: None,
    };

    let value = serde_json::to_value(&outer).unwrap();
    assert_eq!(value["detail-type"], "sticker.assigned");
    assert_eq!(value["detail"], r#"{"specversion":"1.0"}"#);
    assert_eq!(value["resources"], json!([]));
    assert!(value.get("metadata").is_none());
}

#[test]
fn test_outer_envelope_accepts_object_detail() {
    let outer: OuterEnvelope = serde_json::from_value(json!({
        "detail-type": "users.userRegistered.v1",
        "detail": { "specversion": "1.0", "id": "1" },
        "metadata": { "replayed": true }
    }))
    .unwrap();

    let detail: serde_json::Value = serde_json::from_str(&outer.detail).unwrap();
    assert_eq!(detail["id"], "1");
    assert_eq!(outer.version, "");
    assert_eq!(outer.metadata.unwrap()["replayed"], true);
}

#[test]
fn test_peek_headers_keeps_strings_only() {
    let detail = json!({
        "specversion": "1.0",
        "data": { "accountId": "user-1" },
        "datadog": { "traceparent": "00-abc-def-01", "retries": 3 }
    })
    .to_string();

    let headers = peek_headers(&detail);
    assert_eq!(headers.len(), 1);
    assert_eq!(headers["traceparent"], "00-abc-def-01");

    assert!(peek_headers("not json").is_empty());
    assert!(peek_headers(r#"{"specversion":"1.0"}"#).is_empty());
    assert!(peek_headers(r#"{"headers":{"traceparent":"00-abc-def-01"}}"#).is_empty());
}

// ============================================================================
// Publisher
// ============================================================================

#[tokio::test]
async fn test_publish_wraps_for_bus() {
    let bus = MemoryBus::new(BUS);
    let publisher = EventBridgePublisher::new(Arc::new(bus.clone()), BUS);
    let event = StickerAssignedToUserEvent::new("user-123", "sticker-001", Utc::now(), None);

    publisher.publish_sticker_assigned(&event).await.unwrap();

    let published = bus.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].detail_type, "sticker.assigned");
    assert_eq!(published[0].source, SERVICE_SOURCE);

    let inner: CloudEvent<StickerAssignedToUserEvent> =
        serde_json::from_str(&published[0].detail).unwrap();
    assert_eq!(inner.event_type, "com.datadog.stickerlandia.sticker.assigned.v1");
    assert_eq!(inner.source, BUS_EVENT_SOURCE);
    assert_eq!(inner.datacontenttype.as_deref(), Some("application/json"));
    assert_eq!(inner.data.account_id, "user-123");
    assert!(inner.headers.contains_key(CHECKPOINT_HEADER));
}

#[tokio::test]
async fn test_failed_entry_is_partial_failure() {
    let bus = MemoryBus::new(BUS);
    bus.fail_next("ThrottlingException", "Rate exceeded").await;
    let publisher = EventBridgePublisher::new(Arc::new(bus.clone()), BUS);

    let err = publisher
        .publish_sticker_removed(&StickerRemovedFromUserEvent::new("user-1", "s", Utc::now()))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "EventBridge error: ThrottlingException - Rate exceeded");
    assert!(bus.published().await.is_empty());
}

#[tokio::test]
async fn test_unknown_bus_is_reported() {
    let bus = MemoryBus::new(BUS);
    let publisher = EventBridgePublisher::new(Arc::new(bus), "missing-bus");

    let err = publisher
        .publish_sticker_claimed(&StickerClaimedEvent::new("user-1", "s", Utc::now()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MessagingError::PartialFailure { ref code, .. } if code == "ResourceNotFoundException"
    ));
}

#[tokio::test]
async fn test_publish_after_close_is_rejected() {
    let bus = MemoryBus::new(BUS);
    let publisher = EventBridgePublisher::new(Arc::new(bus.clone()), BUS);
    publisher.close().await.unwrap();
    publisher.close().await.unwrap();

    let event = StickerAssignedToUserEvent::new("user-1", "s", Utc::now(), None);
    assert!(matches!(
        publisher.publish_sticker_assigned(&event).await,
        Err(MessagingError::Publish(_))
    ));
    assert!(bus.published().await.is_empty());
}

// ============================================================================
// Consumer
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_success_deletes_message() {
    let queue = MemoryQueue::new(QUEUE_URL);
    queue.send(outer_body(TOPIC_USER_REGISTERED, "user-123")).await;
    let handler = Arc::new(RecordingHandler::new(TOPIC_USER_REGISTERED));
    let consumer = sqs_consumer(&queue, 10, handler.clone());

    let runner = run(&consumer);
    wait_until(|| async { queue.depth().await == 0 }).await;
    assert_eq!(consumer.state(), ConsumerState::Started);

    consumer.stop().await.unwrap();
    runner.await.unwrap().unwrap();

    assert_eq!(handler.account_ids().await, vec!["user-123"]);
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_handler_failure_is_redelivered() {
    let queue = MemoryQueue::new(QUEUE_URL);
    let id = queue.send(outer_body(TOPIC_USER_REGISTERED, "user-123")).await;
    let handler = Arc::new(RecordingHandler::new(TOPIC_USER_REGISTERED).failing(1));
    let consumer = sqs_consumer(&queue, 10, handler.clone());

    let runner = run(&consumer);
    wait_until(|| async { handler.seen().await.len() == 1 }).await;
    assert_eq!(queue.depth().await, 1);

    // Visible again after 30s, then handled and deleted.
    wait_until(|| async { queue.depth().await == 0 }).await;
    assert_eq!(handler.seen().await.len(), 2);
    assert_eq!(queue.receive_count(&id).await, None);

    consumer.stop().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unhandled_detail_type_is_deleted() {
    let queue = MemoryQueue::new(QUEUE_URL);
    queue.send(outer_body("users.unknown.v1", "user-123")).await;
    let handler = Arc::new(RecordingHandler::new(TOPIC_USER_REGISTERED));
    let consumer = sqs_consumer(&queue, 10, handler.clone());

    let runner = run(&consumer);
    wait_until(|| async { queue.depth().await == 0 }).await;
    assert!(handler.seen().await.is_empty());

    consumer.stop().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_malformed_outer_envelope_stays_queued() {
    let queue = MemoryQueue::new(QUEUE_URL);
    let bad = queue.send("this is not an envelope").await;
    queue.send(outer_body(TOPIC_USER_REGISTERED, "user-123")).await;
    let handler = Arc::new(RecordingHandler::new(TOPIC_USER_REGISTERED));
    let consumer = sqs_consumer(&queue, 10, handler.clone());

    let runner = run(&consumer);
    wait_until(|| async { handler.seen().await.len() == 1 }).await;
    wait_until(|| async { queue.depth().await == 1 }).await;
    assert!(queue.receive_count(&bad).await.unwrap() >= 1);

    consumer.stop().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let queue = MemoryQueue::new(QUEUE_URL);
    for i in 0..6 {
        queue.send(outer_body(TOPIC_USER_REGISTERED, &format!("user-{i}"))).await;
    }
    let handler = Arc::new(
        RecordingHandler::new(TOPIC_USER_REGISTERED).holding(Duration::from_secs(1)),
    );
    let consumer = sqs_consumer(&queue, 2, handler.clone());
    assert_eq!(consumer.max_concurrency(), 2);

    let runner = run(&consumer);
    wait_until(|| async { queue.depth().await == 0 }).await;
    assert_eq!(handler.seen().await.len(), 6);
    assert_eq!(handler.peak_in_flight(), 2);

    consumer.stop().await.unwrap();
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_drains_in_flight() {
    let queue = MemoryQueue::new(QUEUE_URL);
    queue.send(outer_body(TOPIC_USER_REGISTERED, "user-123")).await;
    let handler = Arc::new(
        RecordingHandler::new(TOPIC_USER_REGISTERED).holding(Duration::from_secs(5)),
    );
    let consumer = sqs_consumer(&queue, 10, handler.clone());

    let runner = run(&consumer);
    wait_until(|| async { queue.in_flight().await == 1 }).await;

    consumer.stop().await.unwrap();

    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(handler.seen().await.len(), 1);
    assert_eq!(queue.depth().await, 0);
    runner.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_receive_errors_back_off() {
    let queue = MemoryQueue::new(QUEUE_URL);
    queue.fail_next_receives(2);
    queue.send(outer_body(TOPIC_USER_REGISTERED, "user-123")).await;
    let handler = Arc::new(RecordingHandler::new(TOPIC_USER_REGISTERED));
    let consumer = sqs_consumer(&queue, 10, handler.clone());
    let started = tokio::time::Instant::now();

    let runner = run(&consumer);
    wait_until(|| async { queue.depth().await == 0 }).await;
    assert!(started.elapsed() >= Duration::from_secs(10));

    consumer.stop().await.unwrap();
    runner.await.unwrap().unwrap();
}

struct UnreachableQueue;

#[async_trait]
impl QueueClient for UnreachableQueue {
    async fn receive(&self, _options: &ReceiveOptions) -> Result<Vec<QueueMessage>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _receipt_handle: &str) -> Result<()> {
        Ok(())
    }

    async fn check_reachable(&self) -> Result<()> {
        Err(MessagingError::Connection("queue does not exist".to_string()))
    }
}

#[tokio::test]
async fn test_unreachable_queue_fails_start() {
    let mut consumer = SqsConsumer::new(Arc::new(UnreachableQueue), &consumer_config(10));
    consumer
        .register_handler(HandlerRegistration::UserRegistered(Arc::new(
            RecordingHandler::new(TOPIC_USER_REGISTERED),
        )))
        .unwrap();

    let err = consumer.start().await.unwrap_err();

    assert!(matches!(err, MessagingError::Connection(_)));
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn test_start_without_handlers_fails() {
    let queue = MemoryQueue::new(QUEUE_URL);
    let consumer = SqsConsumer::new(Arc::new(queue), &consumer_config(10));

    let err = consumer.start().await.unwrap_err();

    assert_eq!(err.to_string(), "Configuration error: no topics registered");
    assert_eq!(consumer.state(), ConsumerState::Created);
}

#[tokio::test]
async fn test_register_after_start_rejected() {
    let queue = MemoryQueue::new(QUEUE_URL);
    let mut consumer = SqsConsumer::new(Arc::new(queue), &consumer_config(10));
    consumer.stop().await.unwrap();

    let err = consumer
        .register_handler(HandlerRegistration::UserRegistered(Arc::new(
            RecordingHandler::new(TOPIC_USER_REGISTERED),
        )))
        .unwrap_err();
    assert!(matches!(err, MessagingError::Config(_)));
}

#[tokio::test]
async fn test_handle_message_routes_by_detail_type() {
    let handler = Arc::new(RecordingHandler::new(TOPIC_USER_REGISTERED));
    let mut registry = HandlerRegistry::new();
    registry
        .register(HandlerRegistration::UserRegistered(handler.clone()))
        .unwrap();

    let message = QueueMessage {
        message_id: Some("m-1".to_string()),
        receipt_handle: Some("r-1".to_string()),
        body: Some(outer_body(TOPIC_USER_REGISTERED, "user-7")),
    };
    handle_message(&registry, &message).await.unwrap();
    assert_eq!(handler.account_ids().await, vec!["user-7"]);

    let empty = QueueMessage::default();
    assert!(matches!(
        handle_message(&registry, &empty).await,
        Err(MessagingError::Envelope(_))
    ));
}
