//! Pool management and lifecycle.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{Executor, Result, ScheduledHandle, Scheduler, Task, WorkerConfig, Workers};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_LONG_TASK_THRESHOLD: Duration = Duration::from_secs(60);
const DEFAULT_THREAD_NAME_PREFIX: &str = "shared-pool";

/// Overrides the default idle timeout of worker threads, in milliseconds.
pub const IDLE_TIMEOUT_ENV: &str = "SHARED_POOL_IDLE_TIMEOUT_MS";

/// Overrides the default long-task threshold, in milliseconds. Zero disables reporting.
pub const LONG_TASK_ENV: &str = "SHARED_POOL_LONG_TASK_MS";

/// State shared by the pool handles, the worker threads, the scheduler thread and every task
/// closure in flight.
pub(crate) struct PoolCore {
    pub(crate) workers: Arc<Workers>,
    pub(crate) scheduler: Arc<Scheduler>,
}

impl PoolCore {
    fn shutdown(&self) {
        debug!("shutting down shared pool");

        // Workers first, so that timers drained by the scheduler are rejected.
        self.workers.shutdown();
        self.scheduler.shutdown();
    }
}

impl fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCore")
            .field("workers", &self.workers)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

// Owned only by `SharedPool` handles, so dropping the last handle shuts the pool down even
// though threads and pending timers still reference the core.
#[derive(Debug)]
struct PoolInner {
    core: Arc<PoolCore>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

/// An elastic worker pool with a single-thread delay scheduler.
///
/// * Worker threads are created on demand, with no upper bound and no core threads. A worker
///   that stays idle for the idle timeout (default 60 seconds) retires.
/// * The scheduler thread only tracks delays. When a delay elapses the task is handed to the
///   worker pool, so a long task never holds up other schedules.
/// * Tasks that run longer than the long-task threshold are reported in the log.
///
/// The pool is a cheaply cloneable handle. There is no hidden global instance: create one and
/// pass it to the components that need it.
///
/// # Lifetime
///
/// When the last handle is dropped (or [`shutdown()`](Self::shutdown) is called), the pool stops
/// accepting work. Tasks already queued still run. Scheduled tasks that have not been handed off
/// yet complete with [`Error::Rejected`][crate::Error::Rejected]. Shutdown does not wait for
/// running tasks.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use shared_pool::SharedPool;
///
/// let pool = SharedPool::new();
///
/// let handle = pool.schedule_once(|| 6 * 7, Duration::from_millis(10));
/// assert_eq!(handle.get(), Ok(42));
/// ```
#[derive(Clone, Debug)]
pub struct SharedPool {
    inner: Arc<PoolInner>,
}

impl SharedPool {
    /// Creates a new pool with default settings.
    ///
    /// Use [`SharedPool::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the pool.
    ///
    /// The builder starts from the defaults, adjusted by the `SHARED_POOL_*` environment
    /// variables.
    #[must_use]
    pub fn builder() -> SharedPoolBuilder {
        SharedPoolBuilder::new()
    }

    fn core(&self) -> &Arc<PoolCore> {
        &self.inner.core
    }

    /// Submits a fire-and-forget task.
    ///
    /// A panic in the task is logged and otherwise ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`][crate::Error::Rejected] if the pool has been shut down.
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core().workers.execute(Box::new(task))
    }

    /// Submits a task and returns a handle to its result.
    ///
    /// If the pool has been shut down, the returned handle is already done with
    /// [`Error::Rejected`][crate::Error::Rejected].
    pub fn submit<F, R>(&self, task: F) -> ScheduledHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        ScheduledHandle::submit(self.core(), task)
    }

    /// Runs a task once, after `delay` has elapsed.
    pub fn schedule_once<F, R>(&self, task: F, delay: Duration) -> ScheduledHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Clone + Send + 'static,
    {
        ScheduledHandle::schedule_once(self.core(), task, delay)
    }

    /// Runs a task at `initial_delay + k * period` for k = 0, 1, 2, ...
    ///
    /// The tick times do not depend on how long each run takes. A tick that arrives while the
    /// previous run is still in progress is skipped: runs never overlap and never queue up.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        task: F,
        initial_delay: Duration,
        period: Duration,
    ) -> ScheduledHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        ScheduledHandle::schedule_at_fixed_rate(self.core(), task, initial_delay, period)
    }

    /// Runs a task after `initial_delay` and then again `delay` after each run completes.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        task: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> ScheduledHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        ScheduledHandle::schedule_with_fixed_delay(self.core(), task, initial_delay, delay)
    }

    /// Stops accepting new work. See the type-level documentation for details.
    pub fn shutdown(&self) {
        self.core().shutdown();
    }

    /// Whether [`shutdown()`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.core().workers.is_shut_down()
    }

    /// Number of worker threads currently alive.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.core().workers.live_count()
    }

    /// Number of worker threads waiting for work.
    #[must_use]
    pub fn idle_worker_count(&self) -> usize {
        self.core().workers.idle_count()
    }

    /// Number of timers waiting in the scheduler.
    #[must_use]
    pub fn scheduled_count(&self) -> usize {
        self.core().scheduler.pending_count()
    }
}

impl Default for SharedPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SharedPool {
    fn execute(&self, task: Task) -> Result<()> {
        self.core().workers.execute(task)
    }
}

/// Builder for configuring a [`SharedPool`].
#[derive(Debug)]
pub struct SharedPoolBuilder {
    idle_timeout: Duration,
    long_task_threshold: Option<Duration>,
    thread_name_prefix: String,
}

impl SharedPoolBuilder {
    fn new() -> Self {
        let idle_timeout = env_millis(IDLE_TIMEOUT_ENV).unwrap_or(DEFAULT_IDLE_TIMEOUT);

        let long_task_threshold = match env_millis(LONG_TASK_ENV) {
            Some(Duration::ZERO) => None,
            Some(threshold) => Some(threshold),
            None => Some(DEFAULT_LONG_TASK_THRESHOLD),
        };

        Self {
            idle_timeout,
            long_task_threshold,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }

    /// Sets how long a worker thread waits for work before it retires.
    ///
    /// Default is 60 seconds.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the execution time after which a task is reported as long-running, or `None` to
    /// disable reporting.
    ///
    /// Default is 60 seconds.
    #[must_use]
    pub fn long_task_threshold(mut self, threshold: Option<Duration>) -> Self {
        self.long_task_threshold = threshold;
        self
    }

    /// Sets the prefix of the pool's thread names.
    ///
    /// Default is `shared-pool`. Worker threads are named `<prefix>-<n>` and the scheduler
    /// thread `<prefix>-scheduler`.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Builds the pool and starts its scheduler thread.
    #[must_use]
    pub fn build(self) -> SharedPool {
        let scheduler = Scheduler::start(format!("{}-scheduler", self.thread_name_prefix));

        let workers = Workers::new(WorkerConfig {
            idle_timeout: self.idle_timeout,
            long_task_threshold: self.long_task_threshold,
            thread_name_prefix: self.thread_name_prefix,
        });

        SharedPool {
            inner: Arc::new(PoolInner {
                core: Arc::new(PoolCore { workers, scheduler }),
            }),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let value = env::var(name).ok()?;

    match value.trim().parse::<u64>() {
        Ok(millis) => Some(Duration::from_millis(millis)),
        Err(error) => {
            warn!(name, value = %value, %error, "ignoring invalid environment variable");
            None
        }
    }
}
