//! OTel-native metrics instruments.
//!
//! All instruments are lazily initialized and feature-gated behind `otel`.
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("pb-agent"));

// ============================================================================
// Worker pools
// ============================================================================

/// Messages dropped because every worker stayed busy past the busy timeout.
pub static POOL_DROPPED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("pba.pool.dropped.total")
        .with_description("Messages dropped by saturated worker pools")
        .build()
});

// ============================================================================
// Broker
// ============================================================================

/// Publish RPCs issued to the broker.
pub static PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("pba.publish.total")
        .with_description("Total messages published to the broker")
        .build()
});

/// Generations of supervised tasks that ended in an error.
pub static TASK_FAILURE_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("pba.task.failure.total")
        .with_description("Total failed task generations")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

/// Create a pool label.
pub fn pool_attr(pool: &str) -> KeyValue {
    KeyValue::new("pool", pool.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

/// Create a task label.
pub fn task_attr(task: &str) -> KeyValue {
    KeyValue::new("task", task.to_string())
}
