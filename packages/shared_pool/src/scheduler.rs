//! Single-thread delay scheduler.
//!
//! The scheduler thread only decides *when* something happens. Every fire callback is expected
//! to do nothing more than hand work over to the worker pool, so that a slow task can never
//! delay the ticks of unrelated schedules.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{Error, Result, panic_message};

/// Callback invoked by the scheduler thread when a timer fires.
pub(crate) type Fire = Arc<dyn Fn() + Send + Sync>;

// Delays are capped so that deadline arithmetic cannot overflow.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// One registration with the scheduler, either one-shot or periodic (fixed-rate).
pub(crate) struct Timer {
    state: AtomicU8,

    // Taken when the timer can no longer fire, which releases everything the callback captured.
    fire: Mutex<Option<Fire>>,

    period: Option<Duration>,
    deadline: Mutex<Instant>,
}

impl Timer {
    /// Prevents any future firing. Returns `false` if the timer already fired (one-shot) or was
    /// already cancelled.
    pub(crate) fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Released outside the lock, the callback may own the last reference to arbitrary state.
        let fire = self.fire.lock().take();
        drop(fire);

        true
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Time until the next firing, zero if the timer will not fire again.
    pub(crate) fn remaining(&self) -> Duration {
        if !self.is_pending() {
            return Duration::ZERO;
        }

        self.deadline
            .lock()
            .saturating_duration_since(Instant::now())
    }

    fn take_for_last_firing(&self) -> Option<Fire> {
        if self
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        self.fire.lock().take()
    }

    fn clone_for_periodic_firing(&self) -> Option<Fire> {
        if !self.is_pending() {
            return None;
        }

        self.fire.lock().clone()
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("period", &self.period)
            .field("deadline", &*self.deadline.lock())
            .finish_non_exhaustive()
    }
}

struct Entry {
    deadline: Instant,
    sequence: u64,
    timer: Arc<Timer>,
}

// `BinaryHeap` is a max-heap, so the ordering is reversed to pop the earliest deadline first.
// Equal deadlines fire in registration order.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

// Cancelled timers stay in the heap until their deadline. Once the heap reaches this size, they
// are purged and the threshold moves to twice the surviving count.
const MIN_PURGE_THRESHOLD: usize = 64;

struct Queue {
    entries: BinaryHeap<Entry>,
    next_sequence: u64,
    purge_threshold: usize,
    shutdown: bool,
}

impl Queue {
    fn push(&mut self, deadline: Instant, timer: Arc<Timer>) {
        if self.entries.len() >= self.purge_threshold {
            self.purge_cancelled();
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.entries.push(Entry {
            deadline,
            sequence,
            timer,
        });
    }

    fn purge_cancelled(&mut self) {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.timer.is_pending());

        self.purge_threshold = self
            .entries
            .len()
            .saturating_mul(2)
            .max(MIN_PURGE_THRESHOLD);

        trace!(
            purged = before.saturating_sub(self.entries.len()),
            remaining = self.entries.len(),
            "cancelled timers purged"
        );
    }
}

/// The delay scheduler shared by all handles of one pool.
pub(crate) struct Scheduler {
    queue: Mutex<Queue>,
    wake: Condvar,
}

impl Scheduler {
    /// Creates the scheduler and starts its thread.
    pub(crate) fn start(thread_name: String) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            queue: Mutex::new(Queue {
                entries: BinaryHeap::new(),
                next_sequence: 0,
                purge_threshold: MIN_PURGE_THRESHOLD,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        thread::Builder::new()
            .name(thread_name)
            .spawn({
                let scheduler = Arc::clone(&scheduler);
                move || {
                    debug!("scheduler thread started");
                    scheduler.run();
                    debug!("scheduler thread exiting");
                }
            })
            .expect("failed to spawn scheduler thread: thread spawning failure is not supported");

        scheduler
    }

    /// Registers `fire` to be called after `delay` and then, if `period` is set, every `period`
    /// after that first deadline.
    pub(crate) fn schedule(
        &self,
        delay: Duration,
        period: Option<Duration>,
        fire: Fire,
    ) -> Result<Arc<Timer>> {
        let deadline = deadline_after(Instant::now(), delay);

        let timer = Arc::new(Timer {
            state: AtomicU8::new(PENDING),
            fire: Mutex::new(Some(fire)),
            period: period.map(|period| period.clamp(Duration::from_nanos(1), MAX_DELAY)),
            deadline: Mutex::new(deadline),
        });

        let mut queue = self.queue.lock();

        if queue.shutdown {
            return Err(Error::Rejected);
        }

        queue.push(deadline, Arc::clone(&timer));
        drop(queue);

        self.wake.notify_one();

        trace!(delay_ms = delay.as_millis(), periodic = period.is_some(), "timer scheduled");

        Ok(timer)
    }

    /// Stops accepting timers. Every timer still pending fires one last time on the scheduler
    /// thread, so that whoever waits on it learns that the pool is gone.
    pub(crate) fn shutdown(&self) {
        self.queue.lock().shutdown = true;
        self.wake.notify_one();
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.queue
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.timer.is_pending())
            .count()
    }

    #[cfg_attr(test, mutants::skip)] // Mutations only hang the scheduler thread.
    fn run(&self) {
        let mut queue = self.queue.lock();

        loop {
            if queue.shutdown {
                let remaining = mem::take(&mut queue.entries);
                drop(queue);

                for entry in remaining {
                    if let Some(fire) = entry.timer.take_for_last_firing() {
                        invoke(&fire);
                    }
                }

                return;
            }

            let Some(next_deadline) = queue.entries.peek().map(|entry| entry.deadline) else {
                self.wake.wait(&mut queue);
                continue;
            };

            if next_deadline > Instant::now() {
                self.wake.wait_until(&mut queue, next_deadline);
                continue;
            }

            let Some(entry) = queue.entries.pop() else {
                continue;
            };

            if let Some(fire) = Self::prepare_firing(&mut queue, entry) {
                MutexGuard::unlocked(&mut queue, || invoke(&fire));
            }
        }
    }

    fn prepare_firing(queue: &mut Queue, entry: Entry) -> Option<Fire> {
        let Some(period) = entry.timer.period else {
            return entry.timer.take_for_last_firing();
        };

        let fire = entry.timer.clone_for_periodic_firing()?;

        // Fixed rate: the next tick is relative to the previous deadline, not to "now".
        let next_deadline = deadline_after(entry.deadline, period);
        *entry.timer.deadline.lock() = next_deadline;
        queue.push(next_deadline, entry.timer);

        Some(fire)
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();

        f.debug_struct("Scheduler")
            .field("entries", &queue.entries.len())
            .field("shutdown", &queue.shutdown)
            .finish()
    }
}

fn deadline_after(start: Instant, delay: Duration) -> Instant {
    let delay = delay.min(MAX_DELAY);

    start.checked_add(delay).unwrap_or(start)
}

fn invoke(fire: &Fire) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| fire())) {
        warn!(
            panic = panic_message(payload.as_ref()),
            "timer callback panicked on the scheduler thread"
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use testing::with_watchdog;

    use super::*;

    fn fire(f: impl Fn() + Send + Sync + 'static) -> Fire {
        Arc::new(f)
    }

    fn counting_fire() -> (Arc<AtomicUsize>, Fire) {
        let count = Arc::new(AtomicUsize::new(0));
        let counting = fire({
            let count = Arc::clone(&count);
            move || {
                count.fetch_add(1, Ordering::Relaxed);
            }
        });

        (count, counting)
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn one_shot_fires_once() {
        with_watchdog(|| {
            let scheduler = Scheduler::start("test-scheduler".to_string());
            let (count, fire) = counting_fire();

            let timer = scheduler
                .schedule(Duration::from_millis(10), None, fire)
                .unwrap();

            assert!(testing::wait_until(Duration::from_secs(5), || {
                count.load(Ordering::Relaxed) == 1
            }));
            assert!(!timer.is_pending());
            assert!(!timer.cancel());
            assert_eq!(timer.remaining(), Duration::ZERO);

            scheduler.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn cancelled_timer_never_fires() {
        with_watchdog(|| {
            let scheduler = Scheduler::start("test-scheduler".to_string());
            let (count, fire) = counting_fire();

            let timer = scheduler
                .schedule(Duration::from_millis(50), None, fire)
                .unwrap();

            assert!(timer.remaining() > Duration::ZERO);
            assert!(timer.cancel());
            assert!(!timer.cancel());

            thread::sleep(Duration::from_millis(150));
            assert_eq!(count.load(Ordering::Relaxed), 0);

            scheduler.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn earlier_deadline_fires_first() {
        with_watchdog(|| {
            let scheduler = Scheduler::start("test-scheduler".to_string());
            let order = Arc::new(Mutex::new(Vec::new()));

            for (name, delay_ms) in [("late", 100), ("early", 10)] {
                let order = Arc::clone(&order);
                scheduler
                    .schedule(
                        Duration::from_millis(delay_ms),
                        None,
                        fire(move || order.lock().push(name)),
                    )
                    .unwrap();
            }

            assert!(testing::wait_until(Duration::from_secs(5), || {
                order.lock().len() == 2
            }));
            assert_eq!(*order.lock(), vec!["early", "late"]);

            scheduler.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn periodic_fires_until_cancelled() {
        with_watchdog(|| {
            let scheduler = Scheduler::start("test-scheduler".to_string());
            let (count, fire) = counting_fire();

            let timer = scheduler
                .schedule(Duration::ZERO, Some(Duration::from_millis(10)), fire)
                .unwrap();

            assert!(testing::wait_until(Duration::from_secs(5), || {
                count.load(Ordering::Relaxed) >= 3
            }));
            assert!(timer.is_pending());
            assert!(timer.cancel());

            let after_cancel = count.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(100));

            // At most one tick may have been in flight while cancelling.
            assert!(count.load(Ordering::Relaxed) <= after_cancel + 1);

            scheduler.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shutdown_fires_pending_timers_and_rejects_new_ones() {
        with_watchdog(|| {
            let scheduler = Scheduler::start("test-scheduler".to_string());
            let (count, fire) = counting_fire();

            scheduler
                .schedule(Duration::from_secs(3600), None, Arc::clone(&fire))
                .unwrap();
            assert_eq!(scheduler.pending_count(), 1);

            scheduler.shutdown();

            assert!(testing::wait_until(Duration::from_secs(5), || {
                count.load(Ordering::Relaxed) == 1
            }));
            assert!(matches!(
                scheduler.schedule(Duration::ZERO, None, fire),
                Err(Error::Rejected)
            ));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_callback_does_not_stop_scheduler() {
        with_watchdog(|| {
            let scheduler = Scheduler::start("test-scheduler".to_string());
            let (count, counting) = counting_fire();

            scheduler
                .schedule(Duration::ZERO, None, fire(|| panic!("timer failure")))
                .unwrap();
            scheduler
                .schedule(Duration::from_millis(20), None, counting)
                .unwrap();

            assert!(testing::wait_until(Duration::from_secs(5), || {
                count.load(Ordering::Relaxed) == 1
            }));

            scheduler.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn cancelled_timers_do_not_accumulate() {
        with_watchdog(|| {
            let scheduler = Scheduler::start("test-scheduler".to_string());

            for _ in 0..1000 {
                let timer = scheduler
                    .schedule(Duration::from_secs(3600), None, fire(|| {}))
                    .unwrap();
                assert!(timer.cancel());
            }

            let (count, counting) = counting_fire();
            scheduler
                .schedule(Duration::from_secs(3600), None, counting)
                .unwrap();

            assert!(scheduler.queue.lock().entries.len() <= MIN_PURGE_THRESHOLD);
            assert_eq!(scheduler.pending_count(), 1);

            // The surviving timer still fires on shutdown.
            scheduler.shutdown();
            assert!(testing::wait_until(Duration::from_secs(5), || {
                count.load(Ordering::Relaxed) == 1
            }));
        });
    }

    #[test]
    fn huge_delay_does_not_overflow() {
        let now = Instant::now();
        assert!(deadline_after(now, Duration::MAX) > now);
    }
}
