//! Process-level helpers shared by the library and the worker binary.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
