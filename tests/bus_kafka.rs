//! Kafka integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_kafka --features kafka,test-utils -- --nocapture
//!
//! Uses Redpanda in dev-container mode, which auto-creates topics.

#![cfg(all(feature = "kafka", feature = "test-utils"))]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use testcontainers::{
    core::{ContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use sticker_award::bus::kafka::client::RdKafkaProducer;
use sticker_award::bus::kafka::{LogProducer, ProducerRecord};
use sticker_award::bus::{
    CloudEvent, ConsumerState, EventPublisher, HandlerRegistration, Headers, KafkaConsumer,
    KafkaPublisher, MessageConsumer, TOPIC_STICKER_ASSIGNED, TOPIC_USER_REGISTERED,
};
use sticker_award::config::KafkaConfig;
use sticker_award::events::{StickerAssignedToUserEvent, UserRegisteredEvent};
use sticker_award::test_utils::RecordingHandler;

/// Port in 29000-29999, varied per thread and time.
fn generate_test_port() -> u16 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        .hash(&mut hasher);

    29000 + (hasher.finish() % 1000) as u16
}

/// Start Redpanda advertising the fixed host port, so metadata returned to
/// clients points back at the mapped listener.
async fn start_kafka() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let host_port = generate_test_port();
    let advertised_addr = format!("localhost:{}", host_port);

    let container = GenericImage::new("redpandadata/redpanda", "v24.1.1")
        .with_wait_for(WaitFor::message_on_stderr("Successfully started Redpanda"))
        .with_mapped_port(host_port, ContainerPort::Tcp(9092))
        .with_cmd([
            "redpanda",
            "start",
            "--mode",
            "dev-container",
            "--smp",
            "1",
            "--memory",
            "512M",
            "--overprovisioned",
            "--kafka-addr",
            "0.0.0.0:9092",
            "--advertise-kafka-addr",
            &advertised_addr,
        ])
        .with_startup_timeout(Duration::from_secs(120))
        .start()
        .await
        .expect("Failed to start Redpanda container");

    tokio::time::sleep(Duration::from_secs(3)).await;

    let bootstrap_servers = format!("localhost:{}", host_port);
    println!("Kafka available at: {}", bootstrap_servers);

    (container, bootstrap_servers)
}

fn kafka_config(bootstrap: &str, group_id: &str) -> KafkaConfig {
    KafkaConfig {
        brokers: vec![bootstrap.to_string()],
        group_id: group_id.to_string(),
        ..Default::default()
    }
}

fn registration_record(account_id: &str) -> ProducerRecord {
    let event = CloudEvent::wrap(
        TOPIC_USER_REGISTERED,
        "user-management",
        UserRegisteredEvent {
            event_name: TOPIC_USER_REGISTERED.to_string(),
            event_version: "v1".to_string(),
            account_id: account_id.to_string(),
        },
        None,
    );
    ProducerRecord {
        topic: TOPIC_USER_REGISTERED.to_string(),
        key: account_id.to_string(),
        payload: serde_json::to_vec(&event).unwrap(),
        headers: Headers::new(),
    }
}

#[tokio::test]
async fn test_published_envelope_reaches_topic() {
    let (_container, bootstrap) = start_kafka().await;
    let config = kafka_config(&bootstrap, "assigned-reader");

    let publisher = KafkaPublisher::connect(&config).unwrap();
    let event = StickerAssignedToUserEvent::new("user-123", "sticker-001", Utc::now(), None);
    publisher.publish_sticker_assigned(&event).await.unwrap();
    publisher.close().await.unwrap();

    let reader: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &bootstrap)
        .set("group.id", "assigned-reader")
        .set("auto.offset.reset", "earliest")
        .create()
        .unwrap();
    reader.subscribe(&[TOPIC_STICKER_ASSIGNED]).unwrap();

    let message = tokio::time::timeout(Duration::from_secs(30), reader.recv())
        .await
        .expect("Timed out waiting for record")
        .unwrap();

    assert_eq!(message.key(), Some("user-123".as_bytes()));
    let envelope: CloudEvent<StickerAssignedToUserEvent> =
        serde_json::from_slice(message.payload().unwrap()).unwrap();
    assert_eq!(envelope.event_type, TOPIC_STICKER_ASSIGNED);
    assert_eq!(envelope.data, event);
}

#[tokio::test]
async fn test_consumer_round_trip_and_drain() {
    let (_container, bootstrap) = start_kafka().await;
    let config = kafka_config(&bootstrap, "sticker-award-service");

    let producer = RdKafkaProducer::new(&config).unwrap();
    for account in ["user-1", "user-2", "user-3"] {
        producer.send(registration_record(account)).await.unwrap();
    }
    producer.flush().await.unwrap();

    let handler = Arc::new(RecordingHandler::new(TOPIC_USER_REGISTERED));
    let mut consumer = KafkaConsumer::connect(&config).unwrap();
    consumer
        .register_handler(HandlerRegistration::UserRegistered(handler.clone()))
        .unwrap();
    let consumer = Arc::new(consumer);

    let runner = {
        let consumer = Arc::clone(&consumer);
        tokio::spawn(async move { consumer.start().await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    while handler.seen().await.len() < 3 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Timed out waiting for records"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let mut accounts = handler.account_ids().await;
    accounts.sort();
    assert_eq!(accounts, vec!["user-1", "user-2", "user-3"]);

    consumer.stop().await.unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}
