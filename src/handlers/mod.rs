//! Business handlers for consumed events.
//!
//! Handlers receive already-parsed, already-traced events from the bus
//! pipeline and call into the award service through narrow collaborator
//! traits.

mod user_registered;

pub use user_registered::{UserRegisteredHandler, EXPECTED_EVENT_NAME, USER_REGISTERED_OPERATION};

use async_trait::async_trait;

/// Errors from the award service when assigning a sticker.
#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    #[error("award API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("award API returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

/// The single business entry point the messaging core calls.
#[async_trait]
pub trait WelcomeStickerAssigner: Send + Sync {
    /// Give `account_id` the welcome sticker. Already having it is success.
    async fn assign_welcome_sticker(&self, account_id: &str) -> Result<(), AssignError>;
}
