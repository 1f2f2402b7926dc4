use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;
use value_slot::ValueSlot;

use crate::metrics::TICKS_SKIPPED;
use crate::{Error, Fire, PoolCore, Timer, Workers, task_context};

/// Tracks a task submitted to or scheduled on a [`SharedPool`][crate::SharedPool].
///
/// A scheduled task goes through two phases. While it waits for its delay to elapse, the
/// authoritative delegate is the scheduler timer: [`delay()`](Self::delay) reports the time
/// left and cancelling simply removes the timer. Once the delay elapses, the task is handed off
/// to the worker pool and the authoritative delegate becomes the execution on a worker thread.
/// Cancelling in that phase prevents the execution if it has not started yet and otherwise
/// releases waiters immediately, optionally raising the cooperative interrupt flag observed via
/// [`is_interrupt_requested()`][crate::is_interrupt_requested].
///
/// For periodic schedules the handle completes only when the schedule ends: it is cancelled, a
/// run panics or the pool shuts down.
///
/// The handle is cheaply cloneable. All clones observe the same task.
pub struct ScheduledHandle<R> {
    handoff: Arc<Handoff<R>>,
}

struct Handoff<R> {
    // The result of the task as a whole. The first writer wins.
    outcome: ValueSlot<Result<R, Error>>,

    // Scheduling-phase delegate. Replaced on every re-arm of a fixed-delay schedule.
    timer: Mutex<Option<Arc<Timer>>>,

    // Execution-phase delegate, the most recent run handed to the worker pool.
    direct: ValueSlot<Arc<Execution>>,

    // Fixed-rate ticks are skipped while this is set. A run clears it and checks for pool
    // shutdown under the same lock, so a tick skipped during shutdown is never lost.
    running: Mutex<bool>,
}

/// One run of a task on a worker thread.
#[derive(Debug, Default)]
struct Execution {
    interrupt: Arc<AtomicBool>,
}

impl Execution {
    fn run<T>(&self, f: impl FnOnce() -> T) -> Result<T, Error> {
        task_context::set_interrupt_flag(Arc::clone(&self.interrupt));

        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            let error = Error::from_panic(payload.as_ref());
            trace!(%error, "scheduled task panicked");
            error
        })
    }

    fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }
}

impl<R> Handoff<R>
where
    R: Clone + Send + 'static,
{
    fn new() -> Self {
        Self {
            outcome: ValueSlot::new(),
            timer: Mutex::new(None),
            direct: ValueSlot::new(),
            running: Mutex::new(false),
        }
    }

    fn is_finished(&self) -> bool {
        self.outcome.is_set()
    }

    /// Records the final outcome and stops any further scheduling. Returns `false` if the task
    /// had already finished.
    fn finish(&self, outcome: Result<R, Error>) -> bool {
        if !self
            .outcome
            .compare_and_set_with(|current| current.is_none(), Some(outcome))
        {
            return false;
        }

        if let Some(timer) = self.timer.lock().as_ref() {
            timer.cancel();
        }

        true
    }

    fn install_timer(&self, timer: Arc<Timer>) {
        *self.timer.lock() = Some(Arc::clone(&timer));

        // A cancellation that raced with the installation only saw the previous timer.
        if self.is_finished() {
            timer.cancel();
        }
    }

    /// Claims the fixed-rate run slot. Returns `false` if a run is already in progress.
    fn try_start_run(&self) -> bool {
        !mem::replace(&mut *self.running.lock(), true)
    }

    /// Releases the fixed-rate run slot. Returns whether the pool shut down, in which case no
    /// further tick can start a run.
    fn end_run(&self, workers: &Workers) -> bool {
        let mut running = self.running.lock();
        *running = false;
        workers.is_shut_down()
    }

    fn begin_execution(&self) -> Arc<Execution> {
        let execution = Arc::new(Execution::default());
        self.direct.set(Some(Arc::clone(&execution)));
        execution
    }
}

impl<R> ScheduledHandle<R>
where
    R: Clone + Send + 'static,
{
    fn new() -> Self {
        Self {
            handoff: Arc::new(Handoff::new()),
        }
    }

    pub(crate) fn submit<F>(core: &Arc<PoolCore>, task: F) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let handle = Self::new();
        hand_off_once(core, &handle.handoff, task);
        handle
    }

    pub(crate) fn schedule_once<F>(core: &Arc<PoolCore>, task: F, delay: Duration) -> Self
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let handle = Self::new();

        let task = Mutex::new(Some(task));
        let fire: Fire = {
            let core = Arc::clone(core);
            let handoff = Arc::clone(&handle.handoff);

            Arc::new(move || {
                if let Some(task) = task.lock().take() {
                    hand_off_once(&core, &handoff, task);
                }
            })
        };

        match core.scheduler.schedule(delay, None, fire) {
            Ok(timer) => handle.handoff.install_timer(timer),
            Err(error) => {
                handle.handoff.finish(Err(error));
            }
        }

        handle
    }

    /// Cancels the task.
    ///
    /// If the task is still waiting in the scheduler, it will never run. If it has been handed
    /// off but not started, it will never start. If it is running, waiters are released
    /// immediately with [`Error::Cancelled`] and, when `interrupt` is set, the task can observe
    /// the request via [`is_interrupt_requested()`][crate::is_interrupt_requested].
    ///
    /// Returns `false` if the task had already completed, failed or been cancelled.
    pub fn cancel(&self, interrupt: bool) -> bool {
        if !self.handoff.finish(Err(Error::Cancelled)) {
            return false;
        }

        trace!(interrupt, "scheduled task cancelled");

        if interrupt {
            if let Some(execution) = self.handoff.direct.get() {
                execution.interrupt();
            }
        }

        true
    }

    /// Whether the task has completed, failed or been cancelled.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.handoff.is_finished()
    }

    /// Whether the task was cancelled before it completed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handoff
            .outcome
            .inspect(|outcome| matches!(outcome, Some(Err(Error::Cancelled))))
    }

    /// Time left until the task is next handed to the worker pool.
    ///
    /// Zero once the task has been handed off (for one-shot tasks), while a fixed-delay task is
    /// running and after the task is done.
    #[must_use]
    pub fn delay(&self) -> Duration {
        if self.is_done() {
            return Duration::ZERO;
        }

        self.handoff
            .timer
            .lock()
            .as_ref()
            .map_or(Duration::ZERO, |timer| timer.remaining())
    }

    /// Blocks until the task is done and returns its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the task was cancelled, [`Error::Panicked`] if it panicked
    /// and [`Error::Rejected`] if the pool shut down before the task could run.
    pub fn get(&self) -> Result<R, Error> {
        self.handoff.outcome.wait_for_value()
    }

    /// Same as [`get()`](Self::get) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimedOut`] if the task was not done in time, otherwise the same errors
    /// as [`get()`](Self::get).
    pub fn get_timeout(&self, timeout: Duration) -> Result<R, Error> {
        self.handoff
            .outcome
            .wait_for_value_timeout(timeout)
            .unwrap_or(Err(Error::TimedOut))
    }

    /// Returns the outcome if the task is done, without blocking.
    #[must_use]
    pub fn try_get(&self) -> Option<Result<R, Error>> {
        self.handoff.outcome.get()
    }
}

impl ScheduledHandle<()> {
    pub(crate) fn schedule_at_fixed_rate<F>(
        core: &Arc<PoolCore>,
        task: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = Self::new();

        let task = Arc::new(task);
        let fire: Fire = {
            let core = Arc::clone(core);
            let handoff = Arc::clone(&handle.handoff);

            Arc::new(move || tick_fixed_rate(&core, &handoff, &task))
        };

        match core.scheduler.schedule(initial_delay, Some(period), fire) {
            Ok(timer) => handle.handoff.install_timer(timer),
            Err(error) => {
                handle.handoff.finish(Err(error));
            }
        }

        handle
    }

    pub(crate) fn schedule_with_fixed_delay<F>(
        core: &Arc<PoolCore>,
        task: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = Self::new();

        arm_fixed_delay(core, &handle.handoff, Arc::new(task), initial_delay, delay);

        handle
    }
}

fn hand_off_once<F, R>(core: &PoolCore, handoff: &Arc<Handoff<R>>, task: F)
where
    F: FnOnce() -> R + Send + 'static,
    R: Clone + Send + 'static,
{
    if handoff.is_finished() {
        return;
    }

    // The direct delegate is published before the task can start, so a canceller either sees it
    // or the task sees the cancellation before running.
    let execution = handoff.begin_execution();

    let result = core.workers.execute(Box::new({
        let handoff = Arc::clone(handoff);

        move || {
            if handoff.is_finished() {
                return;
            }

            let outcome = execution.run(task);
            handoff.finish(outcome);
        }
    }));

    if let Err(error) = result {
        handoff.finish(Err(error));
    }
}

fn tick_fixed_rate<F>(core: &PoolCore, handoff: &Arc<Handoff<()>>, task: &Arc<F>)
where
    F: Fn() + Send + Sync + 'static,
{
    if handoff.is_finished() {
        return;
    }

    if !handoff.try_start_run() {
        TICKS_SKIPPED.with(|e| e.observe_once());
        trace!("fixed-rate tick skipped, previous run still in progress");
        return;
    }

    let execution = handoff.begin_execution();

    let result = core.workers.execute(Box::new({
        let handoff = Arc::clone(handoff);
        let workers = Arc::clone(&core.workers);
        let task = Arc::clone(task);

        move || {
            let handoff = scopeguard::guard(handoff, move |handoff| {
                if handoff.end_run(&workers) {
                    handoff.finish(Err(Error::Rejected));
                }
            });

            if handoff.is_finished() {
                return;
            }

            if let Err(error) = execution.run(|| task()) {
                handoff.finish(Err(error));
            }
        }
    }));

    if let Err(error) = result {
        *handoff.running.lock() = false;
        handoff.finish(Err(error));
    }
}

fn arm_fixed_delay<F>(
    core: &Arc<PoolCore>,
    handoff: &Arc<Handoff<()>>,
    task: Arc<F>,
    delay: Duration,
    next_delay: Duration,
) where
    F: Fn() + Send + Sync + 'static,
{
    let fire: Fire = {
        let core = Arc::clone(core);
        let handoff = Arc::clone(handoff);

        Arc::new(move || run_fixed_delay(&core, &handoff, &task, next_delay))
    };

    match core.scheduler.schedule(delay, None, fire) {
        Ok(timer) => handoff.install_timer(timer),
        Err(error) => {
            handoff.finish(Err(error));
        }
    }
}

fn run_fixed_delay<F>(
    core: &Arc<PoolCore>,
    handoff: &Arc<Handoff<()>>,
    task: &Arc<F>,
    delay: Duration,
) where
    F: Fn() + Send + Sync + 'static,
{
    if handoff.is_finished() {
        return;
    }

    let execution = handoff.begin_execution();

    let result = core.workers.execute(Box::new({
        let core = Arc::clone(core);
        let handoff = Arc::clone(handoff);
        let task = Arc::clone(task);

        move || {
            if handoff.is_finished() {
                return;
            }

            match execution.run(|| task()) {
                // The next run is scheduled relative to the completion of this one.
                Ok(()) => {
                    if !handoff.is_finished() {
                        arm_fixed_delay(&core, &handoff, task, delay, delay);
                    }
                }
                Err(error) => {
                    handoff.finish(Err(error));
                }
            }
        }
    }));

    if let Err(error) = result {
        handoff.finish(Err(error));
    }
}

impl<R> Clone for ScheduledHandle<R> {
    fn clone(&self) -> Self {
        Self {
            handoff: Arc::clone(&self.handoff),
        }
    }
}

impl<R> fmt::Debug for ScheduledHandle<R>
where
    R: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("is_done", &self.is_done())
            .field("is_cancelled", &self.is_cancelled())
            .field("delay", &self.delay())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ScheduledHandle<u32>: Send, Sync, Clone);

    #[test]
    fn rejected_handle_is_done_with_error() {
        let handle = ScheduledHandle::<u32>::new();
        assert!(handle.handoff.finish(Err(Error::Rejected)));

        assert!(handle.is_done());
        assert!(!handle.is_cancelled());
        assert!(!handle.cancel(true));
        assert_eq!(handle.get(), Err(Error::Rejected));
        assert_eq!(handle.delay(), Duration::ZERO);
    }

    #[test]
    fn first_outcome_wins() {
        let handle = ScheduledHandle::<u32>::new();

        assert!(handle.handoff.finish(Ok(1)));
        assert!(!handle.handoff.finish(Ok(2)));
        assert!(!handle.cancel(false));

        assert_eq!(handle.try_get(), Some(Ok(1)));
    }

    #[test]
    fn cancel_interrupts_current_execution() {
        let handle = ScheduledHandle::<u32>::new();
        let execution = handle.handoff.begin_execution();

        assert!(handle.cancel(true));
        assert!(handle.is_cancelled());
        assert!(execution.interrupt.load(Ordering::Acquire));
        assert_eq!(handle.get_timeout(Duration::ZERO), Err(Error::Cancelled));
    }

    #[test]
    fn cancel_without_interrupt_leaves_flag_clear() {
        let handle = ScheduledHandle::<u32>::new();
        let execution = handle.handoff.begin_execution();

        assert!(handle.cancel(false));
        assert!(!execution.interrupt.load(Ordering::Acquire));
    }

    #[test]
    fn get_timeout_on_pending_task() {
        let handle = ScheduledHandle::<u32>::new();

        assert_eq!(
            handle.get_timeout(Duration::from_millis(10)),
            Err(Error::TimedOut)
        );
        assert_eq!(handle.try_get(), None);
    }

    #[test]
    fn execution_captures_panic() {
        let execution = Execution::default();

        let outcome = execution.run(|| -> u32 { panic!("run failure") });

        assert_eq!(
            outcome,
            Err(Error::Panicked {
                message: "run failure".to_string()
            })
        );
        task_context::reset();
    }
}
