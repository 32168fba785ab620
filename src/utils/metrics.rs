//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).
//! The OTel Collector / Prometheus exporter converts dots to underscores.

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("sticker-award"));

// ============================================================================
// Data Streams
// ============================================================================

/// Checkpoints recorded at produce and consume boundaries.
pub static CHECKPOINT_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("sticker_award.checkpoint.total")
        .with_description("Data streams checkpoints recorded")
        .build()
});

/// Time between the producer checkpoint and the consumer checkpoint.
pub static PIPELINE_LAG: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("sticker_award.pipeline.lag")
        .with_description("Produce to consume latency")
        .with_unit("s")
        .build()
});

// ============================================================================
// Messaging
// ============================================================================

/// Total publish operations.
pub static PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("sticker_award.publish.total")
        .with_description("Total event publish operations")
        .build()
});

/// Total inbound messages processed.
pub static CONSUME_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("sticker_award.consume.total")
        .with_description("Total inbound messages processed")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create a messaging.system label.
pub fn system_attr(system: &str) -> KeyValue {
    KeyValue::new("messaging.system", system.to_string())
}

/// Create a topic label.
pub fn topic_attr(topic: &str) -> KeyValue {
    KeyValue::new("topic", topic.to_string())
}

/// Create a direction label (in, out).
pub fn direction_attr(direction: &str) -> KeyValue {
    KeyValue::new("direction", direction.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Map a result onto the outcome label value.
pub fn outcome_of<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "success"
    } else {
        "error"
    }
}
