#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests and examples in this workspace.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under
/// Miri, where thread synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog
/// is disabled and the test function is executed directly. This allows mutation
/// testing to properly detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    with_watchdog_timeout(timeout, test_fn)
}

/// Same as [`with_watchdog`] but with a caller-chosen timeout, for tests that legitimately
/// take several seconds (e.g. exercising periodic schedules).
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
pub fn with_watchdog_timeout<F, R>(timeout: Duration, test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Polls `condition` every few milliseconds until it returns `true` or `timeout` elapses.
///
/// Returns whether the condition was satisfied.
#[must_use]
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let stopwatch = Stopwatch::start();

    loop {
        if condition() {
            return true;
        }

        if stopwatch.elapsed() >= timeout {
            return condition();
        }

        thread::sleep(Duration::from_millis(5));
    }
}

/// Measures the time since it was started.
#[derive(Clone, Copy, Debug)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    /// Starts a new stopwatch.
    #[must_use]
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Time elapsed since the stopwatch was started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Asserts that `elapsed` is within `[min, max]`.
///
/// Timing assertions in tests should use generous upper bounds, as CI machines can be slow.
///
/// # Panics
///
/// Panics if the elapsed time is out of range.
#[track_caller]
pub fn assert_elapsed_between(elapsed: Duration, min: Duration, max: Duration) {
    assert!(
        elapsed >= min,
        "expected at least {min:?} to elapse but only {elapsed:?} did"
    );
    assert!(
        elapsed <= max,
        "expected at most {max:?} to elapse but {elapsed:?} did"
    );
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_allows_fast_tests() {
        let result = with_watchdog(|| 42);
        assert_eq!(result, 42);
    }

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog_timeout(Duration::from_secs(5), || "hello world");
        assert_eq!(result, "hello world");
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn wait_until_observes_change() {
        let counter = Arc::new(AtomicUsize::new(0));

        let worker = thread::spawn({
            let counter = Arc::clone(&counter);
            move || {
                thread::sleep(Duration::from_millis(20));
                counter.store(1, Ordering::Relaxed);
            }
        });

        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::Relaxed) == 1
        }));
        worker.join().unwrap();
    }

    #[test]
    fn wait_until_gives_up() {
        assert!(!wait_until(Duration::from_millis(10), || false));
    }

    #[test]
    fn elapsed_in_range() {
        assert_elapsed_between(
            Duration::from_millis(5),
            Duration::from_millis(1),
            Duration::from_millis(10),
        );
    }

    #[test]
    #[should_panic]
    fn elapsed_too_short() {
        assert_elapsed_between(
            Duration::from_millis(1),
            Duration::from_millis(5),
            Duration::from_millis(10),
        );
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn stopwatch_measures() {
        let watch = Stopwatch::start();
        thread::sleep(Duration::from_millis(5));
        assert!(watch.elapsed() >= Duration::from_millis(5));
    }
}
