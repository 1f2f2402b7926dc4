use std::sync::Arc;

use crate::Result;

/// A unit of fire-and-forget work accepted by an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs work items, now or later, on some thread.
///
/// This is the seam through which components decide where their work runs: on the calling
/// thread ([`CallerThread`]), on a [`SharedPool`][crate::SharedPool] or on anything else that
/// can accept a boxed closure.
#[cfg_attr(test, mockall::automock)]
pub trait Executor: Send + Sync {
    /// Runs the task or arranges for it to be run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`][crate::Error::Rejected] if the executor no longer accepts
    /// work. The task has been dropped in this case.
    fn execute(&self, task: Task) -> Result<()>;
}

/// An [`Executor`] that runs every task synchronously on the thread that submits it.
///
/// Panics in the task propagate to the caller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CallerThread;

impl Executor for CallerThread {
    fn execute(&self, task: Task) -> Result<()> {
        task();
        Ok(())
    }
}

impl<E> Executor for Arc<E>
where
    E: Executor + ?Sized,
{
    fn execute(&self, task: Task) -> Result<()> {
        (**self).execute(task)
    }
}

impl<E> Executor for &E
where
    E: Executor + ?Sized,
{
    fn execute(&self, task: Task) -> Result<()> {
        (**self).execute(task)
    }
}
