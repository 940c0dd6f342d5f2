//! Elastic worker pool.
//!
//! Each pipeline drains its inbound messages through one pool. Workers are
//! spawned on demand up to a limit and retire after an idle period; a
//! message that cannot be handed to a worker within the busy timeout is
//! dropped rather than queued.
//!
//! ## Hand-off
//! ```text
//! dispatch(msg)
//!   ├─ idle worker waiting? ──────────────▶ hand off, no allocation
//!   ├─ workers < limit? ──▶ spawn worker
//!   └─ wait ≤ busy_timeout for an idle worker ──▶ hand off | drop + warn
//! ```
//!
//! An idle worker parks a oneshot sender on the pool's idle stack and waits
//! on it. The dispatcher pops the most recently parked sender, so the hottest
//! workers stay busy and surplus workers time out.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn, Instrument};

/// Default maximum number of concurrent workers per pipeline.
pub const DEFAULT_WORKER_LIMIT: usize = 4096;

/// Duration after which an idle worker stops to save resources.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(1 << 7);

/// Duration after which a message is dropped if all workers are busy.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(1 << 6);

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Maximum number of concurrent workers.
    pub limit: usize,
    /// Idle period after which a worker retires, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Maximum hand-off wait when all workers are busy, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_WORKER_LIMIT,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl WorkerPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Processes one message taken from a pool.
///
/// Failures are local to the message: implementations log and return.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T);
}

/// Outcome of [`WorkerPool::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Delivered,
    Dropped,
}

/// Pool counters.
///
/// Shared across pipeline generations. Only the pool updates them.
#[derive(Debug, Default)]
pub struct PoolStats {
    workers: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    spawned: AtomicU64,
    retired: AtomicU64,
}

impl PoolStats {
    /// Currently live workers.
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Messages dropped because no worker became available in time.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Workers that stopped after their idle timeout.
    pub fn retired(&self) -> u64 {
        self.retired.load(Ordering::Relaxed)
    }
}

struct Shared<T> {
    idle: Mutex<Vec<oneshot::Sender<T>>>,
    available: Notify,
    stats: Arc<PoolStats>,
}

impl<T> Shared<T> {
    fn park(&self, slot: oneshot::Sender<T>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
        self.available.notify_one();
    }

    fn hand_off(&self, mut item: T) -> Result<(), T> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(slot) = idle.pop() {
            // A closed slot belongs to a worker that already stopped waiting.
            match slot.send(item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }
        }
        Err(item)
    }
}

/// Bounded, elastic set of workers draining one pipeline.
pub struct WorkerPool<T> {
    name: &'static str,
    limit: usize,
    idle_timeout: Duration,
    busy_timeout: Duration,
    handler: Arc<dyn MessageHandler<T>>,
    shared: Arc<Shared<T>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create an empty pool. Workers observe a child of `cancel`.
    pub fn new(
        name: &'static str,
        config: &WorkerPoolConfig,
        handler: Arc<dyn MessageHandler<T>>,
        stats: Arc<PoolStats>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            name,
            limit: config.limit,
            idle_timeout: config.idle_timeout(),
            busy_timeout: config.busy_timeout(),
            handler,
            shared: Arc::new(Shared {
                idle: Mutex::new(Vec::new()),
                available: Notify::new(),
                stats,
            }),
            cancel: cancel.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Hand `item` to a worker, spawning one if below the limit.
    ///
    /// Waits at most the busy timeout once every worker is occupied; the item
    /// is then dropped and a warning logged. Never retries.
    pub async fn dispatch(&self, item: T) -> Dispatch {
        let mut item = match self.shared.hand_off(item) {
            Ok(()) => return self.delivered(),
            Err(item) => item,
        };

        if self.try_reserve_worker() {
            self.spawn_worker();
        }

        let deadline = Instant::now() + self.busy_timeout;
        loop {
            let available = self.shared.available.notified();
            item = match self.shared.hand_off(item) {
                Ok(()) => return self.delivered(),
                Err(item) => item,
            };
            tokio::select! {
                _ = available => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "otel")]
                    {
                        use crate::utils::metrics::{self, POOL_DROPPED_TOTAL};
                        POOL_DROPPED_TOTAL.add(1, &[metrics::pool_attr(self.name)]);
                    }
                    warn!(
                        pool = self.name,
                        workers = self.shared.stats.workers(),
                        limit = self.limit,
                        "Worker pool busy, drop message"
                    );
                    return Dispatch::Dropped;
                }
                _ = self.cancel.cancelled() => {
                    debug!(pool = self.name, "Worker pool stopped, drop message");
                    return Dispatch::Dropped;
                }
            }
        }
    }

    /// Stop idle workers and wait for busy ones to finish their message.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!(pool = self.name, "Worker pool drained");
    }

    fn delivered(&self) -> Dispatch {
        self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
        Dispatch::Delivered
    }

    fn try_reserve_worker(&self) -> bool {
        let limit = self.limit;
        self.shared
            .stats
            .workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn spawn_worker(&self) {
        self.shared.stats.spawned.fetch_add(1, Ordering::Relaxed);
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            handler: Arc::clone(&self.handler),
            idle_timeout: self.idle_timeout,
        };
        let cancel = self.cancel.clone();
        let name = self.name;
        self.tracker.spawn(
            async move {
                match worker.run(&cancel).await {
                    Ok(()) => debug!(pool = name, "Worker retired"),
                    Err(WorkerStopped) => debug!(pool = name, "Worker stopped"),
                }
            }
            .in_current_span(),
        );
    }
}

/// Returned by a worker that exited on cancellation.
#[derive(Debug)]
struct WorkerStopped;

struct Worker<T> {
    shared: Arc<Shared<T>>,
    handler: Arc<dyn MessageHandler<T>>,
    idle_timeout: Duration,
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        self.shared.stats.workers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T: Send + 'static> Worker<T> {
    async fn run(&self, cancel: &CancellationToken) -> Result<(), WorkerStopped> {
        loop {
            let (slot, mut rx) = oneshot::channel();
            self.shared.park(slot);

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // A hand-off that won the race is already counted delivered.
                    rx.close();
                    if let Ok(item) = rx.try_recv() {
                        self.handler.handle(item).await;
                    }
                    return Err(WorkerStopped);
                }
                received = &mut rx => match received {
                    Ok(item) => item,
                    Err(_) => return Ok(()),
                },
                _ = tokio::time::sleep(self.idle_timeout) => {
                    // Closing first settles a concurrent hand-off either way.
                    rx.close();
                    match rx.try_recv() {
                        Ok(item) => item,
                        Err(_) => {
                            self.shared.stats.retired.fetch_add(1, Ordering::Relaxed);
                            return Ok(());
                        }
                    }
                }
            };

            self.handler.handle(item).await;
        }
    }
}
