use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Write-many, read-many cell used to publish what a consumer has received.
///
/// This is deliberately not a `ValueSlot` so that the consumer bookkeeping of a slot never has
/// to be generic over another slot.
#[derive(Debug)]
pub(crate) struct Latch<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Latch<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn with_value(value: T) -> Self {
        Self {
            value: Mutex::new(Some(value)),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn set(&self, value: T) {
        *self.value.lock() = Some(value);
        self.ready.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.value.lock().is_some()
    }
}

impl<T> Latch<T>
where
    T: Clone,
{
    pub(crate) fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    pub(crate) fn wait(&self) -> T {
        let mut value = self.value.lock();

        loop {
            if let Some(value) = value.as_ref() {
                return value.clone();
            }

            self.ready.wait(&mut value);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };

        let mut value = self.value.lock();

        while value.is_none() {
            if self.ready.wait_until(&mut value, deadline).timed_out() {
                break;
            }
        }

        value.clone()
    }
}
