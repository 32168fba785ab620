//! In-memory brokers for standalone mode and tests.
//!
//! Both implement the same primitive traits as the real clients, so the
//! Kafka and AWS adapters run unchanged on top of them:
//!
//! - [`MemoryLog`]: hash-partitioned topics with per-group committed offsets
//! - [`MemoryBus`] + [`MemoryQueue`]: a bus that wraps entries in the outer
//!   envelope and routes them by detail-type to queues with visibility
//!   timeouts and receipt-handle deletes
//!
//! Timing uses `tokio::time`, so paused-clock tests can step through
//! long polls and visibility timeouts instantly.

mod log;
mod queue;

pub use log::{MemoryLog, MemoryLogConsumer, MemoryLogProducer, DEFAULT_PARTITIONS};
pub use queue::{MemoryBus, MemoryQueue, MEMORY_ACCOUNT, MEMORY_REGION};
