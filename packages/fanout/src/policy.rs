use tracing::{debug, info};

use crate::DeliveryError;

const DEFAULT_MAX_ERRORS: u32 = 3;

/// What to do about a message that could not be delivered or queued.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorResponse {
    /// Remove the listener from the registry and discard its queued messages.
    EvictListener,

    /// Discard the message and carry on with the next one.
    DropMessage,

    /// Try the same message again after a pause.
    ///
    /// For a full backlog this blocks the dispatching caller until the listener catches up,
    /// which can stall the caller indefinitely if the listener is stuck.
    RetryMessage,
}

/// Delivery history of one listener, as seen by a [`DeliveryErrorPolicy`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct DeliveryStats {
    /// Failed deliveries so far, including the current one.
    pub total_errors: u32,

    /// Successful deliveries so far.
    pub total_successes: u32,

    /// Failed deliveries since the last success, including the current one.
    pub consecutive_errors: u32,

    /// Whether delivery to this listener can never succeed. The listener is evicted whatever
    /// the policy responds.
    pub fatal: bool,
}

/// Decides how a listener registry reacts to listeners that fail or fall behind.
///
/// Policy callbacks run on the thread that delivers or dispatches the message. A panicking
/// callback is logged and treated as [`ErrorResponse::DropMessage`].
pub trait DeliveryErrorPolicy<L: ?Sized>: Send + Sync {
    /// Called when delivering a message to `listener` failed.
    fn delivery_error(
        &self,
        listener: &L,
        error: &DeliveryError,
        stats: &DeliveryStats,
    ) -> ErrorResponse;

    /// Called when a message does not fit into the listener's queue.
    ///
    /// `consecutive_backlog_errors` counts the failed attempts to queue a message since the
    /// last successful one, including this one. The default evicts the listener.
    fn excessive_backlog(
        &self,
        listener: &L,
        backlog: usize,
        consecutive_backlog_errors: u32,
    ) -> ErrorResponse {
        _ = (listener, backlog, consecutive_backlog_errors);
        ErrorResponse::EvictListener
    }

    /// Called when an eviction removed the last listener of the registry.
    ///
    /// Listeners may have been added since, so this says nothing about the current state.
    fn last_listener_removed(&self) {}
}

/// Evicts a listener after a number of consecutive delivery errors or on a fatal error.
///
/// Until the limit is reached, failed messages are retried (the default) or dropped. A full
/// backlog evicts the listener.
///
/// # Example
///
/// ```rust
/// use fanout::{DeliveryError, DeliveryErrorPolicy, DeliveryStats, ErrorCountPolicy, ErrorResponse};
///
/// let policy = ErrorCountPolicy::dropping_messages(5);
/// let stats = DeliveryStats::default();
///
/// let response =
///     DeliveryErrorPolicy::<str>::delivery_error(&policy, "listener", &DeliveryError::AccessDenied, &stats);
/// assert_eq!(response, ErrorResponse::DropMessage);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ErrorCountPolicy {
    max_errors: u32,
    retry: bool,
}

impl ErrorCountPolicy {
    /// Evicts after `max_errors` consecutive errors and retries failed messages until then.
    #[must_use]
    pub fn new(max_errors: u32) -> Self {
        Self {
            max_errors,
            retry: true,
        }
    }

    /// Evicts after `max_errors` consecutive errors and drops failed messages until then.
    #[must_use]
    pub fn dropping_messages(max_errors: u32) -> Self {
        Self {
            max_errors,
            retry: false,
        }
    }
}

impl Default for ErrorCountPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERRORS)
    }
}

impl<L: ?Sized> DeliveryErrorPolicy<L> for ErrorCountPolicy {
    fn delivery_error(
        &self,
        _listener: &L,
        error: &DeliveryError,
        stats: &DeliveryStats,
    ) -> ErrorResponse {
        debug!(
            %error,
            fatal = stats.fatal,
            consecutive_errors = stats.consecutive_errors,
            max_errors = self.max_errors,
            "listener delivery error"
        );

        if stats.fatal || stats.consecutive_errors >= self.max_errors {
            info!(%error, "listener evicted due to delivery errors");
            return ErrorResponse::EvictListener;
        }

        if self.retry {
            ErrorResponse::RetryMessage
        } else {
            ErrorResponse::DropMessage
        }
    }
}
