//! Per-task context of the thread currently running a pool task.
//!
//! Pool worker threads are reused for unrelated tasks, so anything a task attaches to its thread
//! is cleared once the task ends.

use std::borrow::Cow;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct TaskContext {
    label: Option<Cow<'static, str>>,
    interrupt: Option<Arc<AtomicBool>>,
}

thread_local! {
    static CURRENT: RefCell<TaskContext> = RefCell::new(TaskContext::default());
}

/// Attaches a human-readable label to the task running on the current thread.
///
/// The label shows up in the pool's logs about the task (long-running task reports and panics)
/// and is cleared automatically when the task ends. Calling this outside a pool task labels the
/// thread until the next pool task finishes on it, which for non-pool threads is never.
///
/// # Example
///
/// ```rust
/// use shared_pool::{SharedPool, current_task_label, label_current_task};
///
/// let pool = SharedPool::new();
///
/// let handle = pool.submit(|| {
///     label_current_task("import batch 17");
///     current_task_label()
/// });
///
/// assert_eq!(handle.get().unwrap().as_deref(), Some("import batch 17"));
/// ```
pub fn label_current_task(label: impl Into<Cow<'static, str>>) {
    CURRENT.with_borrow_mut(|context| context.label = Some(label.into()));
}

/// Returns the label attached via [`label_current_task()`], if any.
#[must_use]
pub fn current_task_label() -> Option<String> {
    CURRENT.with_borrow(|context| context.label.as_ref().map(|label| label.to_string()))
}

/// Whether the task running on the current thread has been cancelled with interruption.
///
/// Threads cannot be forcibly interrupted, so a long-running task that wants to react to
/// `cancel(true)` on its [`ScheduledHandle`][crate::ScheduledHandle] polls this flag and returns
/// early. Always `false` outside tasks that were started through a handle.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    CURRENT.with_borrow(|context| {
        context
            .interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    })
}

pub(crate) fn set_interrupt_flag(flag: Arc<AtomicBool>) {
    CURRENT.with_borrow_mut(|context| context.interrupt = Some(flag));
}

/// Clears the context of the current thread, returning the label the task had set.
pub(crate) fn reset() -> Option<Cow<'static, str>> {
    CURRENT.with_borrow_mut(|context| {
        context.interrupt = None;
        context.label.take()
    })
}
