//! Inbound middleware pipeline.
//!
//! Every received message, whatever the broker, passes through [`process`]:
//!
//! 1. record the inbound checkpoint (best effort)
//! 2. parse the body as a [`CloudEvent`]
//! 3. open a new root span linked to the producer trace
//! 4. run the typed handler inside that span
//!
//! Parse and handler errors are returned unchanged; the broker adapter
//! decides what to acknowledge. Nothing here retries.

use serde::de::DeserializeOwned;
use tracing::{debug, warn, Instrument, Span};

use super::checkpoint::{self, BrokerType};
use super::envelope::{CloudEvent, SpanLink};
use super::registry::CloudEventHandler;
use super::telemetry;
use super::{Headers, MessagingError, Result};

/// A raw message handed over by a broker adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic or bus detail-type the message arrived on.
    pub topic: String,
    /// Serialized event envelope.
    pub body: Vec<u8>,
    pub headers: Headers,
    pub broker: BrokerType,
}

/// Per-message context passed to business handlers.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub topic: String,
    pub event_id: String,
    /// Root processing span; handlers already run inside it.
    pub span: Span,
    /// Links back to the producing trace.
    pub links: Vec<SpanLink>,
}

/// Parse `message` and hand the typed event to `handler`.
pub async fn process<T>(handler: &dyn CloudEventHandler<T>, message: &InboundMessage) -> Result<()>
where
    T: DeserializeOwned + Send + 'static,
{
    checkpoint::record_inbound(message.broker, &message.topic, &message.headers);
    let system = message.broker.messaging_system();

    let event: CloudEvent<T> = match serde_json::from_slice(&message.body) {
        Ok(event) => event,
        Err(e) => {
            let span = telemetry::consumer_span(
                handler.operation_name(),
                system,
                &message.topic,
                message.body.len(),
                &[],
            );
            let err = MessagingError::Envelope(e);
            telemetry::record_error(&span, &err);
            span.in_scope(|| {
                warn!(topic = %message.topic, error = %err, "Failed to parse event envelope")
            });
            record_outcome(system, &message.topic, "error");
            return Err(err);
        }
    };

    let links = event.span_links();
    let span = telemetry::consumer_span(
        handler.operation_name(),
        system,
        &message.topic,
        message.body.len(),
        &links,
    );
    let ctx = MessageContext {
        topic: message.topic.clone(),
        event_id: event.id.clone(),
        span: span.clone(),
        links,
    };

    let result = handler.handle(&ctx, event).instrument(span.clone()).await;

    match &result {
        Ok(()) => {
            span.in_scope(|| debug!(event_id = %ctx.event_id, "Event processed"));
            record_outcome(system, &message.topic, "success");
        }
        Err(e) => {
            telemetry::record_error(&span, e);
            record_outcome(system, &message.topic, "error");
        }
    }
    result
}

#[cfg(feature = "otel")]
fn record_outcome(system: &str, topic: &str, outcome: &str) {
    use crate::utils::metrics::{self, CONSUME_TOTAL};
    CONSUME_TOTAL.add(
        1,
        &[
            metrics::system_attr(system),
            metrics::topic_attr(topic),
            metrics::outcome_attr(outcome),
        ],
    );
}

#[cfg(not(feature = "otel"))]
fn record_outcome(_system: &str, _topic: &str, _outcome: &str) {}
