use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::Latch;

type Deregister = Box<dyn Fn() -> bool + Send + Sync>;

/// Tracks a consumer registered via [`ValueSlot::consume_value`][crate::ValueSlot::consume_value]
/// or [`ValueSlot::consume_all_values`][crate::ValueSlot::consume_all_values].
///
/// The handle exposes the last value handed to the consumer and allows the consumer to be
/// removed from the slot before (further) delivery.
///
/// For one-shot consumers `T` is the slot value type. For persistent consumers `T` is
/// `Option<V>`, so that an absent value can be told apart from a missing delivery.
pub struct ConsumerHandle<T> {
    delivered: Arc<Latch<T>>,

    // `None` if the consumer was satisfied immediately and never registered with the slot.
    deregister: Option<Deregister>,

    cancelled: AtomicBool,
}

impl<T> ConsumerHandle<T> {
    pub(crate) fn immediate(value: T) -> Self {
        Self {
            delivered: Arc::new(Latch::with_value(value)),
            deregister: None,
            cancelled: AtomicBool::new(false),
        }
    }

    pub(crate) fn registered(delivered: Arc<Latch<T>>, deregister: Deregister) -> Self {
        Self {
            delivered,
            deregister: Some(deregister),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Whether the consumer has received at least one value.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.delivered.is_set()
    }

    /// Whether the consumer was removed from the slot via [`cancel()`](Self::cancel).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Removes the consumer from the slot.
    ///
    /// Returns `true` if the consumer was still registered. A one-shot consumer that has
    /// already received its value cannot be cancelled, nor can a consumer that was satisfied
    /// immediately when it was registered.
    pub fn cancel(&self) -> bool {
        let Some(deregister) = &self.deregister else {
            return false;
        };

        let removed = deregister();

        if removed {
            self.cancelled.store(true, Ordering::Release);
        }

        removed
    }
}

impl<T> ConsumerHandle<T>
where
    T: Clone,
{
    /// Returns the last value handed to the consumer, without blocking.
    #[must_use]
    pub fn try_get(&self) -> Option<T> {
        self.delivered.get()
    }

    /// Blocks until the consumer has received a value and returns it.
    ///
    /// Blocks forever if the consumer is cancelled before it receives anything.
    #[must_use]
    pub fn wait(&self) -> T {
        self.delivered.wait()
    }

    /// Blocks until the consumer has received a value or the timeout elapses.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        self.delivered.wait_timeout(timeout)
    }
}

impl<T> fmt::Debug for ConsumerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("is_done", &self.is_done())
            .field("is_cancelled", &self.is_cancelled())
            .field("registered", &self.deregister.is_some())
            .finish()
    }
}
