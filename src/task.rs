//! Supervised long-running tasks.
//!
//! A task is a closure producing one generation at a time. Each generation
//! gets a child cancellation token; when it ends in an error the supervisor
//! waits out the next backoff delay and starts a fresh generation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::utils::retry::{dial_task_backoff, TASK_MAX_DELAY};

/// Generations running at least this long reset the backoff.
pub const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);

/// When a finished generation is followed by another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRestart {
    Never,
    OnFailure,
    Always,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub id: &'static str,
    pub restart: TaskRestart,
    pub backoff: ExponentialBuilder,
}

impl TaskConfig {
    /// Restart on failure with [`dial_task_backoff`].
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            restart: TaskRestart::OnFailure,
            backoff: dial_task_backoff(),
        }
    }

    pub fn with_restart(mut self, restart: TaskRestart) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run generations of `f` until cancelled or the restart policy says stop.
///
/// Returns the result of the last generation, or `Ok(())` when cancelled.
pub async fn run_task<F, Fut, E>(
    cancel: CancellationToken,
    config: TaskConfig,
    mut f: F,
) -> Result<(), E>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let task = config.id;
    let mut backoff = config.backoff.build();
    let mut generation: u64 = 0;

    loop {
        generation += 1;
        let started = Instant::now();
        debug!(task, generation, "Task started");
        let result = f(cancel.child_token()).await;

        if cancel.is_cancelled() {
            debug!(task, generation, "Task stopped");
            return Ok(());
        }

        let restart = match (&result, config.restart) {
            (_, TaskRestart::Never) => false,
            (Ok(()), TaskRestart::OnFailure) => false,
            (Err(_), TaskRestart::OnFailure) | (_, TaskRestart::Always) => true,
        };
        if let Err(e) = &result {
            warn!(task, generation, error = %e, "Task failed");
            #[cfg(feature = "otel")]
            {
                use crate::utils::metrics::{self, TASK_FAILURE_TOTAL};
                TASK_FAILURE_TOTAL.add(1, &[metrics::task_attr(task)]);
            }
        }
        if !restart {
            return result;
        }

        if started.elapsed() >= BACKOFF_RESET_AFTER {
            backoff = config.backoff.build();
        }
        let delay = backoff.next().unwrap_or(TASK_MAX_DELAY);
        info!(task, delay = ?delay, "Restarting task");
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task, "Task cancelled during backoff");
                return Ok(());
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
