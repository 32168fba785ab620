//! Portable event envelope and W3C trace-link codec.
//!
//! Every domain event travels inside a CloudEvents 1.0 shaped envelope.
//! When a span is active at publish time its identity is written to the
//! `traceparent` attribute; consumers turn it back into a span link so
//! their processing trace can point at the producer without becoming its child.
//!
//! Trace ids are carried lossily: only the low 64 bits of the 128-bit id
//! are encoded, and only the low 64 bits are read back. Both sides must
//! truncate the same way or correlation silently breaks.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::Headers;

/// CloudEvents specification version stamped on every envelope.
pub const SPEC_VERSION: &str = "1.0";

/// W3C traceparent version field.
const TRACEPARENT_VERSION: &str = "00";
/// W3C trace flags written by producers (sampled).
const TRACEPARENT_FLAGS: &str = "01";

/// Span identity captured at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSpan {
    pub trace_id: u128,
    pub span_id: u64,
}

impl ActiveSpan {
    /// Encode as `00-<32 hex trace id>-<16 hex span id>-01`.
    ///
    /// The trace id field holds the low 64 bits zero-padded to 32 characters.
    pub fn traceparent(&self) -> String {
        format!(
            "{}-{:032x}-{:016x}-{}",
            TRACEPARENT_VERSION, self.trace_id as u64, self.span_id, TRACEPARENT_FLAGS
        )
    }
}

/// Reference from a consumer trace back to the producing trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanLink {
    /// Low 64 bits of the producer trace id.
    pub trace_id: u64,
    pub span_id: u64,
}

/// Broker-neutral event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent<T> {
    pub specversion: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub id: String,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    pub data: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    /// Correlation headers (checkpoints, propagation fields) carried next to `data`
    /// in the `datadog` bag other stickerlandia services read and write.
    #[serde(rename = "datadog", default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
}

impl<T> CloudEvent<T> {
    /// Wrap a payload for transport.
    ///
    /// Generates a fresh id, stamps the current time at second precision and,
    /// when `active` is set, records it as the `traceparent`.
    pub fn wrap(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: T,
        active: Option<ActiveSpan>,
    ) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            event_type: event_type.into(),
            source: source.into(),
            id: Uuid::new_v4().to_string(),
            time: Utc::now().trunc_subsecs(0),
            datacontenttype: None,
            data,
            traceparent: active.map(|span| span.traceparent()),
            headers: Headers::new(),
        }
    }

    /// Set `datacontenttype`.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.datacontenttype = Some(content_type.into());
        self
    }

    /// Span links recovered from `traceparent`.
    ///
    /// Absent or malformed values yield no links; trace correlation never
    /// blocks message processing.
    pub fn span_links(&self) -> Vec<SpanLink> {
        match self.traceparent.as_deref() {
            Some(value) => parse_traceparent(value).into_iter().collect(),
            None => {
                debug!(event_id = %self.id, "No traceparent on envelope, no span links to create");
                Vec::new()
            }
        }
    }

    /// Split into the payload and its span links.
    pub fn into_parts(self) -> (T, Vec<SpanLink>) {
        let links = self.span_links();
        (self.data, links)
    }
}

/// Parse a W3C `traceparent` into a span link.
///
/// Requires exactly four dash-separated fields with hex trace and span ids.
/// A 32-character trace id is truncated to its low 16 characters first,
/// mirroring the producer side.
pub fn parse_traceparent(traceparent: &str) -> Option<SpanLink> {
    if traceparent.is_empty() {
        debug!("Empty traceparent, no span links to create");
        return None;
    }

    let parts: Vec<&str> = traceparent.split('-').collect();
    if parts.len() != 4 {
        info!(
            traceparent = %traceparent,
            "Invalid traceparent format - expected 4 parts separated by dashes"
        );
        return None;
    }

    let trace_hex = if parts[1].len() == 32 {
        parts[1].get(16..)
    } else {
        Some(parts[1])
    };

    let Some(trace_id) = trace_hex.and_then(parse_hex_u64) else {
        info!(
            trace_id = %parts[1],
            traceparent = %traceparent,
            "Failed to parse trace ID from traceparent - invalid hex format"
        );
        return None;
    };

    let Some(span_id) = parse_hex_u64(parts[2]) else {
        info!(
            span_id = %parts[2],
            traceparent = %traceparent,
            "Failed to parse span ID from traceparent - invalid hex format"
        );
        return None;
    };

    debug!(trace_id, span_id, "Created span link from traceparent");
    Some(SpanLink { trace_id, span_id })
}

// `from_str_radix` tolerates a leading sign, which is not valid hex here.
fn parse_hex_u64(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(value, 16).ok()
}
