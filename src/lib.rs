//! Sticker Award - event messaging core
//!
//! Publishes sticker assignment events and reacts to user registrations
//! over either a partitioned log (Kafka) or a cloud bus/queue pair
//! (EventBridge + SQS), with trace correlation carried in the envelope.

pub mod bus;
pub mod clients;
pub mod config;
pub mod events;
pub mod handlers;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;
