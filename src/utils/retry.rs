//! Backoff presets.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Minimum delay before restarting a failed task.
pub const TASK_MIN_DELAY: Duration = Duration::from_millis(100);

/// Maximum delay before restarting a failed task.
pub const TASK_MAX_DELAY: Duration = Duration::from_secs(10);

/// Backoff between generations of a supervised task.
///
/// - Min delay: 100ms
/// - Max delay: 10s
/// - Unlimited attempts
/// - Jitter enabled
pub fn dial_task_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(TASK_MIN_DELAY)
        .with_max_delay(TASK_MAX_DELAY)
        .without_max_times()
        .with_jitter()
}

/// Backoff for tests and tools that restart immediately.
pub fn no_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::ZERO)
        .with_max_delay(Duration::ZERO)
        .without_max_times()
}
