use thiserror::Error;

/// Why a message could not be delivered to a listener.
///
/// Listener operations that can fail return `Result<(), DeliveryError>`. Panics in listeners are
/// caught and reported as [`DeliveryError::Panicked`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum DeliveryError {
    /// The listener failed to handle the message. Delivery may succeed if retried.
    #[error("listener failed to handle the message: {0}")]
    Failed(String),

    /// The listener can never handle messages again.
    #[error("listener failed permanently: {0}")]
    Fatal(String),

    /// The listener refused access to the operation.
    ///
    /// The first occurrence for a listener switches its delivery into elevated mode and the
    /// message is retried once. Any further occurrence is fatal.
    #[error("listener denied access to the operation")]
    AccessDenied,

    /// The listener panicked while handling the message.
    #[error("listener panicked: {0}")]
    Panicked(String),
}

impl DeliveryError {
    /// Whether delivery to the listener can never succeed after this error.
    ///
    /// Panics count as fatal: they indicate a broken listener rather than a transient failure.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Panicked(_))
    }
}
