//! Integration tests for repeating tasks on a real pool.
//!
//! These tests are ignored under Miri because they rely on real timing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shared_pool::{Error, RepeatingTask, SharedPool};
use testing::{wait_until, with_watchdog};

const THREADS: usize = 8;
const REQUESTS_PER_THREAD: usize = 200;

#[cfg_attr(miri, ignore)]
#[test]
fn concurrent_requests_never_overlap_and_are_never_lost() {
    with_watchdog(|| {
        let pool = SharedPool::new();

        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        // Every request bumps the generation first. A run observes the newest generation, so
        // once all requests are served the last run must have seen the final one.
        let generation = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        let task = RepeatingTask::new(pool.clone(), {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let runs = Arc::clone(&runs);
            let generation = Arc::clone(&generation);
            let seen = Arc::clone(&seen);

            move || {
                let now_active = active.fetch_add(1, Ordering::AcqRel) + 1;
                max_active.fetch_max(now_active, Ordering::AcqRel);

                seen.store(generation.load(Ordering::Acquire), Ordering::Release);
                runs.fetch_add(1, Ordering::Relaxed);
                thread::yield_now();

                active.fetch_sub(1, Ordering::AcqRel);
            }
        });

        let requesters = (0..THREADS)
            .map(|_| {
                let task = task.clone();
                let generation = Arc::clone(&generation);

                thread::spawn(move || {
                    for _ in 0..REQUESTS_PER_THREAD {
                        generation.fetch_add(1, Ordering::AcqRel);
                        task.request_run().unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for requester in requesters {
            requester.join().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || task.is_idle()));

        assert_eq!(max_active.load(Ordering::Acquire), 1);
        assert_eq!(seen.load(Ordering::Acquire), THREADS * REQUESTS_PER_THREAD);

        let runs = runs.load(Ordering::Relaxed);
        assert!(runs >= 1);
        assert!(runs <= THREADS * REQUESTS_PER_THREAD);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn request_after_shutdown_is_rejected_and_task_stays_usable() {
    with_watchdog(|| {
        let pool = SharedPool::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let task = RepeatingTask::new(pool.clone(), {
            let runs = Arc::clone(&runs);
            move || {
                runs.fetch_add(1, Ordering::Relaxed);
            }
        });

        task.request_run().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            task.is_idle() && runs.load(Ordering::Relaxed) == 1
        }));

        pool.shutdown();

        assert_eq!(task.request_run(), Err(Error::Rejected));
        assert!(task.is_idle());
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    });
}
