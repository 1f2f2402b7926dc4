#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! An elastic shared worker pool with a delay scheduler.
//!
//! This crate provides the execution machinery that background components of a process share:
//!
//! * [`SharedPool`] runs fire-and-forget tasks and tasks with a result on an elastic set of
//!   worker threads, and schedules one-shot, fixed-rate and fixed-delay work through a single
//!   scheduler thread that never runs user code itself.
//! * [`ScheduledHandle`] tracks a submitted or scheduled task: wait for its result, cancel it
//!   (optionally interrupting a run in progress) or ask how long until it fires.
//! * [`RepeatingTask`] runs an action on at most one thread at a time and coalesces run
//!   requests that arrive while it is running into a single re-run.
//! * [`Executor`] is the seam through which other components accept "somewhere to run work",
//!   with [`CallerThread`] as the synchronous implementation.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::thread;
//! use std::time::Duration;
//!
//! use shared_pool::SharedPool;
//!
//! let pool = SharedPool::new();
//! let ticks = Arc::new(AtomicUsize::new(0));
//!
//! let handle = pool.schedule_at_fixed_rate(
//!     {
//!         let ticks = Arc::clone(&ticks);
//!         move || {
//!             ticks.fetch_add(1, Ordering::Relaxed);
//!         }
//!     },
//!     Duration::ZERO,
//!     Duration::from_millis(10),
//! );
//!
//! while ticks.load(Ordering::Relaxed) < 3 {
//!     thread::sleep(Duration::from_millis(1));
//! }
//!
//! assert!(handle.cancel(false));
//! assert!(handle.is_cancelled());
//! ```
//!
//! # Observability
//!
//! The pool logs through `tracing` and publishes `nm` metrics: a histogram of task durations,
//! the number of tasks that exceeded the long-task threshold and the number of fixed-rate ticks
//! skipped because the previous run had not finished.

mod error;
mod executor;
mod handle;
mod metrics;
mod pool;
mod repeating;
mod scheduler;
mod task_context;
mod workers;

pub use error::*;
pub use executor::*;
pub use handle::*;
pub use pool::*;
pub use repeating::*;
pub(crate) use scheduler::*;
pub use task_context::*;
pub(crate) use workers::*;
