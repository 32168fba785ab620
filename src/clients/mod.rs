//! Outbound clients for collaborating services.

mod awards;

pub use awards::{assignment_backoff, HttpWelcomeStickerAssigner, ASSIGNMENTS_PATH};
