use std::fmt;
use std::sync::Arc;

use crate::DeliveryError;

/// The return type of a listener operation that can be fanned out.
///
/// Only operations that return nothing, or that only report whether delivery succeeded, can be
/// dispatched: a fan-out call has no single result to hand back to the caller.
pub trait DeliveryOutcome {
    /// Converts the return value of the operation into a delivery result.
    ///
    /// # Errors
    ///
    /// Returns the error the listener reported.
    fn into_delivery_result(self) -> Result<(), DeliveryError>;
}

impl DeliveryOutcome for () {
    fn into_delivery_result(self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

impl DeliveryOutcome for Result<(), DeliveryError> {
    fn into_delivery_result(self) -> Self {
        self
    }
}

type Invoke<L> = dyn Fn(&L) -> Result<(), DeliveryError> + Send + Sync;

/// One fan-out call, captured for replay against every listener.
///
/// The arguments of the call are captured once, by the closure, and the closure is invoked once
/// per listener. The operation name identifies the call for filters and logs.
///
/// # Example
///
/// ```rust
/// use fanout::Message;
///
/// trait Progress {
///     fn advanced(&self, percent: u8);
/// }
///
/// let percent = 40;
/// let message = Message::<dyn Progress>::new("advanced", move |listener| {
///     listener.advanced(percent)
/// });
///
/// assert_eq!(message.operation(), "advanced");
/// ```
pub struct Message<L: ?Sized> {
    operation: &'static str,
    invoke: Arc<Invoke<L>>,
}

impl<L> Message<L>
where
    L: ?Sized + 'static,
{
    /// Captures a call of `operation` that `invoke` replays against a listener.
    #[must_use]
    pub fn new<F, O>(operation: &'static str, invoke: F) -> Self
    where
        F: Fn(&L) -> O + Send + Sync + 'static,
        O: DeliveryOutcome,
    {
        Self {
            operation,
            invoke: Arc::new(move |listener: &L| invoke(listener).into_delivery_result()),
        }
    }
}

impl<L: ?Sized> Message<L> {
    /// Name of the listener operation this message calls.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub(crate) fn deliver(&self, listener: &L) -> Result<(), DeliveryError> {
        (self.invoke)(listener)
    }
}

impl<L: ?Sized> Clone for Message<L> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation,
            invoke: Arc::clone(&self.invoke),
        }
    }
}

impl<L: ?Sized> fmt::Debug for Message<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}
