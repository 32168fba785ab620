//! Domain events published and consumed by the award service.
//!
//! Published events are constructed by the assignment service right after a
//! successful mutation and handed to an [`EventPublisher`](crate::bus::EventPublisher)
//! once. Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::{TOPIC_STICKER_ASSIGNED, TOPIC_STICKER_CLAIMED, TOPIC_STICKER_REMOVED};

/// Event version stamped on every published event.
pub const EVENT_VERSION: &str = "v1";

/// Routing metadata shared by every published event.
pub trait PublishedEvent: Serialize + Send + Sync {
    /// Partitioned-log topic.
    const TOPIC: &'static str;
    /// Cloud bus detail-type.
    const DETAIL_TYPE: &'static str;
    /// Envelope `type` on the cloud bus.
    const CLOUD_EVENT_TYPE: &'static str;

    /// Ordering key; all events for one subject share a partition.
    fn subject_id(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerAssignedToUserEvent {
    pub event_name: String,
    pub event_version: String,
    pub account_id: String,
    pub sticker_id: String,
    pub assigned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StickerAssignedToUserEvent {
    pub fn new(
        account_id: impl Into<String>,
        sticker_id: impl Into<String>,
        assigned_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Self {
        Self {
            event_name: "StickerAssignedToUser".to_string(),
            event_version: EVENT_VERSION.to_string(),
            account_id: account_id.into(),
            sticker_id: sticker_id.into(),
            assigned_at,
            reason,
        }
    }
}

impl PublishedEvent for StickerAssignedToUserEvent {
    const TOPIC: &'static str = TOPIC_STICKER_ASSIGNED;
    const DETAIL_TYPE: &'static str = "sticker.assigned";
    const CLOUD_EVENT_TYPE: &'static str = "com.datadog.stickerlandia.sticker.assigned.v1";

    fn subject_id(&self) -> &str {
        &self.account_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerRemovedFromUserEvent {
    pub event_name: String,
    pub event_version: String,
    pub account_id: String,
    pub sticker_id: String,
    pub removed_at: DateTime<Utc>,
}

impl StickerRemovedFromUserEvent {
    pub fn new(
        account_id: impl Into<String>,
        sticker_id: impl Into<String>,
        removed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_name: "StickerRemovedFromUser".to_string(),
            event_version: EVENT_VERSION.to_string(),
            account_id: account_id.into(),
            sticker_id: sticker_id.into(),
            removed_at,
        }
    }
}

impl PublishedEvent for StickerRemovedFromUserEvent {
    const TOPIC: &'static str = TOPIC_STICKER_REMOVED;
    const DETAIL_TYPE: &'static str = "sticker.removed";
    const CLOUD_EVENT_TYPE: &'static str = "com.datadog.stickerlandia.sticker.removed.v1";

    fn subject_id(&self) -> &str {
        &self.account_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickerClaimedEvent {
    pub event_name: String,
    pub event_version: String,
    pub account_id: String,
    pub sticker_id: String,
    pub claimed_at: DateTime<Utc>,
}

impl StickerClaimedEvent {
    pub fn new(
        account_id: impl Into<String>,
        sticker_id: impl Into<String>,
        claimed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_name: "StickerClaimed".to_string(),
            event_version: EVENT_VERSION.to_string(),
            account_id: account_id.into(),
            sticker_id: sticker_id.into(),
            claimed_at,
        }
    }
}

impl PublishedEvent for StickerClaimedEvent {
    const TOPIC: &'static str = TOPIC_STICKER_CLAIMED;
    const DETAIL_TYPE: &'static str = "sticker.claimed";
    const CLOUD_EVENT_TYPE: &'static str = "com.datadog.stickerlandia.sticker.claimed.v1";

    fn subject_id(&self) -> &str {
        &self.account_id
    }
}

/// Published by user management when an account is created.
///
/// Every field defaults so that validation happens in the handler, where a
/// missing account id becomes a descriptive error instead of a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRegisteredEvent {
    pub event_name: String,
    pub event_version: String,
    pub account_id: String,
}
