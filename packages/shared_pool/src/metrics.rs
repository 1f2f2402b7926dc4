//! Metrics for the shared worker pool.
//!
//! The metrics use per-thread event instances to minimize contention.

use nm::{Event, Magnitude};

/// Histogram buckets for task execution time in milliseconds.
///
/// Pool tasks range from trivial callbacks to multi-minute jobs, hence the long tail.
const TASK_DURATION_MS_BUCKETS: &[Magnitude] = &[
    0, 1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 30_000, 60_000,
];

thread_local! {
    /// Event for observing the execution time of pool tasks.
    ///
    /// The magnitude is the execution time in milliseconds.
    pub(crate) static TASK_DURATION_MS: Event = Event::builder()
        .name("shared_pool_task_duration_ms")
        .histogram(TASK_DURATION_MS_BUCKETS)
        .build();

    /// Event for tasks that ran past the long-task threshold.
    pub(crate) static LONG_TASKS: Event = Event::builder()
        .name("shared_pool_long_tasks")
        .build();

    /// Event for fixed-rate ticks skipped because the previous run was still in progress.
    pub(crate) static TICKS_SKIPPED: Event = Event::builder()
        .name("shared_pool_ticks_skipped")
        .build();
}
