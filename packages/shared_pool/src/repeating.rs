use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace, warn};

use crate::{Error, Executor, Result};

type ErrorHandler = dyn Fn(&Error) + Send + Sync;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Running,
    RunningWithPending,
}

struct Inner {
    // A worker is executing the action if and only if the state is not `Idle`.
    state: Mutex<State>,

    action: Box<dyn Fn() + Send + Sync>,
    executor: Arc<dyn Executor>,
    error_handler: Box<ErrorHandler>,
}

/// An action that runs on at most one thread at a time, with run requests coalesced.
///
/// * If a run is requested while the action is idle, a worker is submitted to the executor.
/// * If a run is requested while the action is running, the worker runs it once more after the
///   current run completes.
/// * Further requests while a re-run is already pending change nothing.
///
/// A storm of requests therefore causes at most one extra run. A panic in the action is handed
/// to the error handler (by default, it is logged) and does not stop the pending re-run.
///
/// The task is a cheaply cloneable handle. All clones share the same state.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use shared_pool::{CallerThread, RepeatingTask};
///
/// let runs = Arc::new(AtomicUsize::new(0));
///
/// let task = RepeatingTask::new(CallerThread, {
///     let runs = Arc::clone(&runs);
///     move || {
///         runs.fetch_add(1, Ordering::Relaxed);
///     }
/// });
///
/// task.request_run().unwrap();
/// assert_eq!(runs.load(Ordering::Relaxed), 1);
/// ```
#[derive(Clone)]
pub struct RepeatingTask {
    inner: Arc<Inner>,
}

impl RepeatingTask {
    /// Creates a task that runs `action` on `executor`, logging panics at the error level.
    pub fn new<E, F>(executor: E, action: F) -> Self
    where
        E: Executor + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        Self::with_error_handler(executor, action, |error| {
            error!(%error, "repeating task action failed");
        })
    }

    /// Creates a task that runs `action` on `executor` and hands failures to `error_handler`.
    pub fn with_error_handler<E, F, H>(executor: E, action: F, error_handler: H) -> Self
    where
        E: Executor + 'static,
        F: Fn() + Send + Sync + 'static,
        H: Fn(&Error) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Idle),
                action: Box::new(action),
                executor: Arc::new(executor),
                error_handler: Box::new(error_handler),
            }),
        }
    }

    /// Requests a run of the action.
    ///
    /// # Errors
    ///
    /// Returns the executor's error if a worker had to be submitted and the executor rejected
    /// it. The task is then idle again, so a later request can retry.
    pub fn request_run(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();

            match *state {
                State::Idle => *state = State::Running,
                State::Running => {
                    *state = State::RunningWithPending;
                    trace!("run requested while running, re-run pending");
                    return Ok(());
                }
                State::RunningWithPending => return Ok(()),
            }
        }

        let rollback = scopeguard::guard(Arc::clone(&self.inner), |inner| {
            *inner.state.lock() = State::Idle;
        });

        let worker = Arc::clone(&self.inner);

        match self.inner.executor.execute(Box::new(move || worker.run_loop())) {
            Ok(()) => {
                scopeguard::ScopeGuard::into_inner(rollback);
                Ok(())
            }
            Err(error) => {
                warn!(%error, "executor rejected repeating task worker");
                drop(rollback);
                Err(error)
            }
        }
    }

    /// Whether no worker is currently executing the action.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        *self.inner.state.lock() == State::Idle
    }
}

impl Inner {
    fn run_loop(&self) {
        // If the error handler unwinds, the task must not stay "running" forever.
        let reset = scopeguard::guard((), |()| {
            *self.state.lock() = State::Idle;
        });

        loop {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.action)())) {
                (self.error_handler)(&Error::from_panic(payload.as_ref()));
            }

            // The transition to idle happens under the same lock as the pending check, so a
            // request arriving in between is never lost.
            let mut state = self.state.lock();

            if *state == State::RunningWithPending {
                *state = State::Running;
                continue;
            }

            *state = State::Idle;
            break;
        }

        scopeguard::ScopeGuard::into_inner(reset);
    }
}

impl fmt::Debug for RepeatingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatingTask")
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}
