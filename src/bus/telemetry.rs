//! Span construction and trace context plumbing for the messaging layer.
//!
//! With the `otel` feature the helpers talk to the OpenTelemetry context
//! attached by `tracing-opentelemetry`. Without it spans are still created
//! for structured logging, but no trace identity is captured or propagated.

use std::fmt::Display;

use tracing::field::Empty;
use tracing::Span;

use super::envelope::{ActiveSpan, SpanLink};
use super::Headers;

/// Identity of the currently active span, if it is a valid sampled trace.
#[cfg(feature = "otel")]
pub fn active_span() -> Option<ActiveSpan> {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = Span::current().context();
    let span = cx.span();
    let span_context = span.span_context();
    if !span_context.is_valid() {
        return None;
    }
    Some(ActiveSpan {
        trace_id: u128::from_be_bytes(span_context.trace_id().to_bytes()),
        span_id: u64::from_be_bytes(span_context.span_id().to_bytes()),
    })
}

#[cfg(not(feature = "otel"))]
pub fn active_span() -> Option<ActiveSpan> {
    None
}

/// Root span for processing one inbound message.
///
/// The span has no parent: producer traces are referenced through `links`,
/// never adopted. Links are attached before the span is first entered.
pub fn consumer_span(
    operation_name: &str,
    system: &str,
    destination: &str,
    envelope_size: usize,
    links: &[SpanLink],
) -> Span {
    let span = tracing::info_span!(
        parent: None,
        "message.process",
        otel.name = %operation_name,
        otel.kind = "consumer",
        otel.status_code = Empty,
        messaging.system = %system,
        messaging.operation.name = "process",
        "messaging.operation.type" = "process",
        messaging.destination = %destination,
        messaging.message.envelope.size = envelope_size,
        error.message = Empty,
    );
    attach_links(&span, links);
    span
}

/// Span wrapping one publish call.
pub fn producer_span(system: &str, destination: &str) -> Span {
    tracing::info_span!(
        "message.publish",
        otel.name = %format!("{destination} publish"),
        otel.kind = "producer",
        otel.status_code = Empty,
        messaging.system = %system,
        messaging.destination = %destination,
        messaging.operation = "publish",
        aws.eventbridge.bus = Empty,
        error.message = Empty,
    )
}

/// Mark `span` as failed.
pub fn record_error(span: &Span, err: &dyn Display) {
    span.record("otel.status_code", "ERROR");
    span.record("error.message", tracing::field::display(err));
}

#[cfg(feature = "otel")]
fn attach_links(span: &Span, links: &[SpanLink]) {
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    for link in links {
        let context = SpanContext::new(
            TraceId::from_bytes(u128::from(link.trace_id).to_be_bytes()),
            SpanId::from_bytes(link.span_id.to_be_bytes()),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        span.add_link(context);
    }
}

#[cfg(not(feature = "otel"))]
fn attach_links(_span: &Span, _links: &[SpanLink]) {}

/// Inject propagation fields for the current span into `headers`.
#[cfg(feature = "otel")]
pub fn inject_context(headers: &mut Headers) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let cx = Span::current().context();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&cx, &mut HeaderInjector(headers));
    });
}

#[cfg(not(feature = "otel"))]
pub fn inject_context(_headers: &mut Headers) {}

/// Adapter to inject OTel context into message headers.
#[cfg(feature = "otel")]
struct HeaderInjector<'a>(&'a mut Headers);

#[cfg(feature = "otel")]
impl opentelemetry::propagation::Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}
