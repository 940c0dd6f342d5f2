//! Process-wide helpers shared by the library and the binary.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
pub mod retry;
