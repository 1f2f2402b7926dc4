//! Elastic set of worker threads.
//!
//! There are no core threads. A worker is started whenever a task arrives and no worker is
//! idle, and a worker that stays idle for the configured timeout retires.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::metrics::{LONG_TASKS, TASK_DURATION_MS};
use crate::{Error, Result, Task, panic_message, task_context};

#[derive(Clone, Debug)]
pub(crate) struct WorkerConfig {
    pub(crate) idle_timeout: Duration,
    pub(crate) long_task_threshold: Option<Duration>,
    pub(crate) thread_name_prefix: String,
}

pub(crate) struct Workers {
    // `None` once the pool has been shut down.
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,

    // Workers waiting for a task that no submitter has claimed yet. Every submission either
    // claims one of these or starts a new worker, so a queued task always has a worker coming
    // for it. A waiting worker may only retire by claiming itself.
    idle: AtomicUsize,

    live: AtomicUsize,
    next_index: AtomicUsize,

    config: WorkerConfig,
}

impl Workers {
    pub(crate) fn new(config: WorkerConfig) -> Arc<Self> {
        let (sender, receiver) = channel::unbounded();

        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            idle: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
            config,
        })
    }

    pub(crate) fn execute(self: &Arc<Self>, task: Task) -> Result<()> {
        {
            let sender = self.sender.lock();

            let Some(sender) = sender.as_ref() else {
                return Err(Error::Rejected);
            };

            // We own a receiver, so the channel cannot be disconnected.
            if sender.send(task).is_err() {
                return Err(Error::Rejected);
            }
        }

        if self.claim_idle_worker() {
            trace!("task handed to an idle worker");
        } else {
            self.start_worker();
        }

        Ok(())
    }

    /// Stops accepting tasks. Tasks already queued still run, after which the workers exit.
    pub(crate) fn shutdown(&self) {
        drop(self.sender.lock().take());
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    fn claim_idle_worker(&self) -> bool {
        self.idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |idle| idle.checked_sub(1))
            .is_ok()
    }

    fn start_worker(self: &Arc<Self>) {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);

        let workers = Arc::clone(self);

        thread::Builder::new()
            .name(format!("{}-{index}", self.config.thread_name_prefix))
            .spawn(move || {
                debug!(index, "worker thread started");
                workers.worker_loop();
                workers.live.fetch_sub(1, Ordering::Relaxed);
                debug!(index, "worker thread exiting");
            })
            .expect("failed to spawn worker thread: thread spawning failure is not supported");
    }

    // A new worker starts out claimed by the submission that started it.
    #[cfg_attr(test, mutants::skip)] // Mutations only hang or leak worker threads.
    fn worker_loop(&self) {
        loop {
            match self.receiver.recv_timeout(self.config.idle_timeout) {
                Ok(task) => {
                    self.run(task);
                    self.idle.fetch_add(1, Ordering::AcqRel);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // If nothing is left to claim, a submitter has claimed us and its task is
                    // on the way.
                    if self.claim_idle_worker() {
                        return;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn run(&self, task: Task) {
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(task));
        let elapsed = started.elapsed();

        let label = task_context::reset();

        TASK_DURATION_MS.with(|e| e.observe_millis(elapsed));

        if let Err(payload) = result {
            warn!(
                label = label.as_deref(),
                panic = panic_message(payload.as_ref()),
                "pool task panicked"
            );
        }

        let Some(threshold) = self.config.long_task_threshold else {
            return;
        };

        if elapsed >= threshold {
            LONG_TASKS.with(|e| e.observe_once());
            info!(
                elapsed_ms = elapsed.as_millis(),
                label = label.as_deref(),
                "pool task ran longer than the long-task threshold"
            );
        }
    }
}

impl fmt::Debug for Workers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workers")
            .field("live", &self.live_count())
            .field("idle", &self.idle_count())
            .field("queued", &self.receiver.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicBool;

    use testing::{wait_until, with_watchdog};

    use super::*;

    fn task(f: impl FnOnce() + Send + 'static) -> Task {
        Box::new(f)
    }

    fn config(idle_timeout: Duration) -> WorkerConfig {
        WorkerConfig {
            idle_timeout,
            long_task_threshold: Some(Duration::from_millis(1)),
            thread_name_prefix: "test-worker".to_string(),
        }
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn runs_task_on_named_worker_thread() {
        with_watchdog(|| {
            let workers = Workers::new(config(Duration::from_secs(60)));
            let name = Arc::new(Mutex::new(None));

            workers
                .execute(Box::new({
                    let name = Arc::clone(&name);
                    move || *name.lock() = thread::current().name().map(str::to_string)
                }))
                .unwrap();

            assert!(wait_until(Duration::from_secs(5), || name.lock().is_some()));
            assert_eq!(name.lock().as_deref(), Some("test-worker-0"));
            assert_eq!(workers.live_count(), 1);

            workers.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn idle_worker_is_reused() {
        with_watchdog(|| {
            let workers = Workers::new(config(Duration::from_secs(60)));

            for _ in 0..5 {
                let done = Arc::new(AtomicBool::new(false));

                workers
                    .execute(Box::new({
                        let done = Arc::clone(&done);
                        move || done.store(true, Ordering::Release)
                    }))
                    .unwrap();

                assert!(wait_until(Duration::from_secs(5), || {
                    done.load(Ordering::Acquire) && workers.idle_count() == 1
                }));
            }

            assert_eq!(workers.live_count(), 1);

            workers.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn idle_workers_retire() {
        with_watchdog(|| {
            let workers = Workers::new(config(Duration::from_millis(20)));

            workers.execute(Box::new(|| {})).unwrap();

            assert!(wait_until(Duration::from_secs(5), || {
                workers.live_count() == 0
            }));
            assert_eq!(workers.idle_count(), 0);
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn panicking_task_does_not_kill_worker() {
        with_watchdog(|| {
            let workers = Workers::new(config(Duration::from_secs(60)));
            let done = Arc::new(AtomicBool::new(false));

            workers
                .execute(task(|| panic!("task failure")))
                .unwrap();
            workers
                .execute(Box::new({
                    let done = Arc::clone(&done);
                    move || done.store(true, Ordering::Release)
                }))
                .unwrap();

            assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::Acquire)));

            workers.shutdown();
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn shutdown_rejects_new_tasks_but_runs_queued_ones() {
        with_watchdog(|| {
            let workers = Workers::new(config(Duration::from_secs(60)));
            let done = Arc::new(AtomicBool::new(false));

            workers
                .execute(Box::new({
                    let done = Arc::clone(&done);
                    move || {
                        thread::sleep(Duration::from_millis(20));
                        done.store(true, Ordering::Release);
                    }
                }))
                .unwrap();

            workers.shutdown();
            assert!(workers.is_shut_down());
            assert_eq!(workers.execute(Box::new(|| {})), Err(Error::Rejected));

            assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::Acquire)));
            assert!(wait_until(Duration::from_secs(5), || {
                workers.live_count() == 0
            }));
        });
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn label_is_cleared_between_tasks() {
        with_watchdog(|| {
            let workers = Workers::new(config(Duration::from_secs(60)));
            let observed = Arc::new(Mutex::new(Vec::new()));

            for label in [Some("first"), None] {
                let observed = Arc::clone(&observed);

                workers
                    .execute(Box::new(move || {
                        observed.lock().push(task_context::current_task_label());

                        if let Some(label) = label {
                            task_context::label_current_task(label);
                        }
                    }))
                    .unwrap();

                assert!(wait_until(Duration::from_secs(5), || {
                    workers.idle_count() == 1
                }));
            }

            assert_eq!(*observed.lock(), vec![None, None]);

            workers.shutdown();
        });
    }
}
