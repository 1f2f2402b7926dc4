use std::any::Any;

use thiserror::Error;

/// Errors reported by the shared worker pool and by the handles it returns.
///
/// The type is cheaply cloneable so that the outcome of a task can be observed by any number of
/// waiters.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The pool has been shut down and no longer accepts work.
    #[error("the pool has been shut down and no longer accepts tasks")]
    Rejected,

    /// The task was cancelled before it produced a result.
    #[error("the task was cancelled")]
    Cancelled,

    /// The task panicked.
    #[error("the task panicked: {message}")]
    Panicked {
        /// The panic payload rendered as text.
        message: String,
    },

    /// The caller stopped waiting before the task produced a result.
    #[error("timed out waiting for the task result")]
    TimedOut,
}

impl Error {
    /// Converts a panic payload captured by `catch_unwind` into an error.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Panicked {
            message: panic_message(payload).to_string(),
        }
    }
}

/// A specialized `Result` type for pool operations, returning the crate's [`Error`] type as the
/// error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Renders a panic payload captured by `catch_unwind` as text.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}
