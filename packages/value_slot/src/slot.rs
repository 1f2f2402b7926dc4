use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, ReentrantMutex};

use crate::{ConsumerHandle, Latch};

/// A thread-safe holder of at most one value of type `V`.
///
/// Every change to the value wakes all blocked waiters and is pushed synchronously to the
/// registered consumers. Waiters are woken while the slot lock is held, so a waiter can never
/// miss an update that happens between checking the value and parking. Consumers receive the
/// changes in order, without the slot lock held, so a consumer may use the slot it is
/// registered with.
///
/// The slot is not cloneable. Wrap it in an `Arc` to share it between threads.
///
/// # Example
///
/// ```rust
/// use value_slot::ValueSlot;
///
/// let slot = ValueSlot::new();
///
/// assert!(slot.compare_and_set(None, Some(1)));
/// assert!(!slot.compare_and_set(None, Some(2)));
/// assert_eq!(slot.get(), Some(1));
/// ```
pub struct ValueSlot<V> {
    shared: Arc<Shared<V>>,
}

struct Shared<V> {
    state: Mutex<State<V>>,

    // Signaled on every change of `State::value`, always with the `state` lock held.
    changed: Condvar,

    // Held by every thread that changes the value or registers a consumer, for as long as the
    // consumers are being notified. Always acquired before `state`.
    delivery: ReentrantMutex<()>,
}

struct State<V> {
    value: Option<V>,

    next_consumer_id: u64,

    single: Vec<SingleConsumer<V>>,
    persistent: Vec<PersistentConsumer<V>>,

    // Set while consumers are being notified. Changes made by the consumers themselves are
    // queued and delivered once the current change has reached every consumer.
    delivering: bool,
    queued: VecDeque<Option<V>>,

    // Persistent consumers taken out of `persistent` for the current delivery, and those of
    // them cancelled before they could be put back.
    in_flight: Vec<u64>,
    cancelled: Vec<u64>,
}

struct SingleConsumer<V> {
    id: u64,
    callback: Box<dyn FnOnce(&V) + Send>,
    delivered: Arc<Latch<V>>,
}

struct PersistentConsumer<V> {
    id: u64,
    callback: Box<dyn FnMut(Option<&V>) + Send>,
    delivered: Arc<Latch<Option<V>>>,
}

impl<V> ValueSlot<V> {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::from_initial(None)
    }

    /// Creates a slot that already holds `value`.
    #[must_use]
    pub fn with_value(value: V) -> Self {
        Self::from_initial(Some(value))
    }

    fn from_initial(value: Option<V>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    value,
                    next_consumer_id: 0,
                    single: Vec::new(),
                    persistent: Vec::new(),
                    delivering: false,
                    queued: VecDeque::new(),
                    in_flight: Vec::new(),
                    cancelled: Vec::new(),
                }),
                changed: Condvar::new(),
                delivery: ReentrantMutex::new(()),
            }),
        }
    }

    /// Whether the slot currently holds a value.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.shared.state.lock().value.is_some()
    }

    /// Calls `f` with a reference to the current value, without cloning it.
    ///
    /// The slot lock is held while `f` runs, so `f` must not access the same slot.
    pub fn inspect<R>(&self, f: impl FnOnce(Option<&V>) -> R) -> R {
        f(self.shared.state.lock().value.as_ref())
    }
}

impl<V> ValueSlot<V>
where
    V: Clone,
{
    /// Returns a copy of the current value without blocking.
    #[must_use]
    pub fn get(&self) -> Option<V> {
        self.shared.state.lock().value.clone()
    }

    /// Replaces the current value, wakes every waiter and notifies every consumer.
    ///
    /// One-shot consumers only receive a present value. Persistent consumers receive every
    /// change, including the slot becoming empty.
    pub fn set(&self, value: Option<V>) {
        self.replace(value);
    }

    /// Same as [`set()`](Self::set) but returns the value that was replaced.
    pub fn replace(&self, value: Option<V>) -> Option<V> {
        let _delivery = self.shared.delivery.lock();
        let mut state = self.shared.state.lock();
        let previous = mem::replace(&mut state.value, value);

        self.shared.publish(state);

        previous
    }

    /// Empties the slot, returning the value it held.
    pub fn clear(&self) -> Option<V> {
        self.replace(None)
    }

    /// Sets the value to `new` if the current value equals `expected`.
    ///
    /// Returns whether the value was set.
    pub fn compare_and_set(&self, expected: Option<&V>, new: Option<V>) -> bool
    where
        V: PartialEq,
    {
        self.compare_and_set_with(|current| current == expected, new)
    }

    /// Sets the value to `new` if `predicate` accepts the current value.
    ///
    /// The predicate runs under the slot lock, so the check and the update are atomic with
    /// respect to every other operation on the slot.
    pub fn compare_and_set_with<P>(&self, predicate: P, new: Option<V>) -> bool
    where
        P: FnOnce(Option<&V>) -> bool,
    {
        let _delivery = self.shared.delivery.lock();
        let mut state = self.shared.state.lock();

        if !predicate(state.value.as_ref()) {
            return false;
        }

        state.value = new;
        self.shared.publish(state);

        true
    }

    /// Blocks until the slot holds a value and returns a copy of it.
    #[must_use]
    pub fn wait_for_value(&self) -> V {
        let mut state = self.shared.state.lock();

        loop {
            if let Some(value) = state.value.as_ref() {
                return value.clone();
            }

            self.shared.changed.wait(&mut state);
        }
    }

    /// Blocks until the slot holds a value or the timeout elapses.
    ///
    /// Returns immediately if a value is already present.
    #[must_use]
    pub fn wait_for_value_timeout(&self, timeout: Duration) -> Option<V> {
        self.wait_map(timeout, |current| current.cloned())
    }

    /// Blocks until the slot holds a value equal to `target` or the timeout elapses.
    ///
    /// Returns whether the target value was observed.
    #[must_use]
    pub fn wait_for_specific_value(&self, target: &V, timeout: Duration) -> bool
    where
        V: PartialEq,
    {
        self.wait_until(|current| current == Some(target), timeout)
    }

    /// Blocks until the value differs from `not_equal_to` or the timeout elapses.
    ///
    /// Returns the differing value, or `not_equal_to` if the timeout elapsed first.
    #[must_use]
    pub fn wait_for_different_value(
        &self,
        not_equal_to: Option<&V>,
        timeout: Duration,
    ) -> Option<V>
    where
        V: PartialEq,
    {
        self.wait_map(timeout, |current| {
            (current != not_equal_to).then(|| current.cloned())
        })
        .unwrap_or_else(|| not_equal_to.cloned())
    }

    /// Blocks until `predicate` accepts the current value or the timeout elapses.
    ///
    /// A timeout too large to be expressed as a deadline waits indefinitely. Returns whether
    /// the predicate was satisfied.
    pub fn wait_until<P>(&self, mut predicate: P, timeout: Duration) -> bool
    where
        P: FnMut(Option<&V>) -> bool,
    {
        self.wait_map(timeout, |current| predicate(current).then_some(()))
            .is_some()
    }

    fn wait_map<R>(
        &self,
        timeout: Duration,
        mut map: impl FnMut(Option<&V>) -> Option<R>,
    ) -> Option<R> {
        let deadline = Instant::now().checked_add(timeout);

        let mut state = self.shared.state.lock();

        loop {
            if let Some(result) = map(state.value.as_ref()) {
                return Some(result);
            }

            match deadline {
                Some(deadline) => {
                    if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                        return map(state.value.as_ref());
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
    }
}

impl<V> ValueSlot<V>
where
    V: Clone + Send + 'static,
{
    /// Hands the next present value to `consumer`, exactly once.
    ///
    /// If the slot already holds a value, the consumer is called before this returns and the
    /// returned handle is already done. Otherwise the consumer is called by the thread that
    /// eventually sets a value, unless the handle is cancelled first.
    pub fn consume_value<F>(&self, consumer: F) -> ConsumerHandle<V>
    where
        F: FnOnce(&V) + Send + 'static,
    {
        let _delivery = self.shared.delivery.lock();
        let mut state = self.shared.state.lock();

        if let Some(value) = state.value.clone() {
            drop(state);

            invoke_isolated(|| consumer(&value));
            return ConsumerHandle::immediate(value);
        }

        let id = state.allocate_consumer_id();
        let delivered = Arc::new(Latch::new());

        state.single.push(SingleConsumer {
            id,
            callback: Box::new(consumer),
            delivered: Arc::clone(&delivered),
        });

        drop(state);

        let shared = Arc::downgrade(&self.shared);
        ConsumerHandle::registered(
            delivered,
            Box::new(move || {
                shared
                    .upgrade()
                    .is_some_and(|shared| shared.remove_single(id))
            }),
        )
    }

    /// Hands the current value (even if absent) to `consumer` and then every later change
    /// until the returned handle is cancelled.
    pub fn consume_all_values<F>(&self, consumer: F) -> ConsumerHandle<Option<V>>
    where
        F: FnMut(Option<&V>) + Send + 'static,
    {
        let _delivery = self.shared.delivery.lock();

        let (id, current) = {
            let mut state = self.shared.state.lock();
            (state.allocate_consumer_id(), state.value.clone())
        };

        let mut entry = PersistentConsumer {
            id,
            callback: Box::new(consumer),
            delivered: Arc::new(Latch::new()),
        };

        // No other thread can change the value while the delivery lock is held.
        entry.deliver(current.as_ref());

        let delivered = Arc::clone(&entry.delivered);
        self.shared.state.lock().persistent.push(entry);

        let shared = Arc::downgrade(&self.shared);
        ConsumerHandle::registered(
            delivered,
            Box::new(move || {
                shared
                    .upgrade()
                    .is_some_and(|shared| shared.remove_persistent(id))
            }),
        )
    }
}

impl<V> Shared<V>
where
    V: Clone,
{
    // Must be called after every change of the value, with the delivery lock held.
    fn publish(&self, mut state: MutexGuard<'_, State<V>>) {
        self.changed.notify_all();

        let current = state.value.clone();

        if state.delivering {
            state.queued.push_back(current);
            return;
        }

        state.delivering = true;
        let mut next = Some(current);

        while let Some(value) = next {
            let single = if value.is_some() {
                mem::take(&mut state.single)
            } else {
                Vec::new()
            };

            let mut persistent = mem::take(&mut state.persistent);
            state.in_flight = persistent.iter().map(|consumer| consumer.id).collect();

            MutexGuard::unlocked(&mut state, || {
                if let Some(value) = value.as_ref() {
                    for consumer in single {
                        consumer.deliver(value);
                    }
                }

                for consumer in &mut persistent {
                    if !self.is_cancelled_in_flight(consumer.id) {
                        consumer.deliver(value.as_ref());
                    }
                }
            });

            let cancelled = mem::take(&mut state.cancelled);
            state.in_flight.clear();

            persistent.retain(|consumer| !cancelled.contains(&consumer.id));

            // Consumers registered during the delivery go after the existing ones.
            persistent.append(&mut state.persistent);
            state.persistent = persistent;

            next = state.queued.pop_front();
        }

        state.delivering = false;
    }
}

impl<V> Shared<V> {
    fn remove_single(&self, id: u64) -> bool {
        let mut state = self.state.lock();

        let Some(index) = state.single.iter().position(|c| c.id == id) else {
            return false;
        };

        state.single.remove(index);
        true
    }

    fn remove_persistent(&self, id: u64) -> bool {
        let mut state = self.state.lock();

        if let Some(index) = state.persistent.iter().position(|c| c.id == id) {
            state.persistent.remove(index);
            return true;
        }

        if state.in_flight.contains(&id) && !state.cancelled.contains(&id) {
            state.cancelled.push(id);
            return true;
        }

        false
    }

    fn is_cancelled_in_flight(&self, id: u64) -> bool {
        self.state.lock().cancelled.contains(&id)
    }
}

impl<V> State<V> {
    fn allocate_consumer_id(&mut self) -> u64 {
        let id = self.next_consumer_id;
        self.next_consumer_id = self.next_consumer_id.wrapping_add(1);
        id
    }
}

impl<V> SingleConsumer<V>
where
    V: Clone,
{
    fn deliver(self, value: &V) {
        let callback = self.callback;
        invoke_isolated(|| callback(value));

        self.delivered.set(value.clone());
    }
}

impl<V> PersistentConsumer<V>
where
    V: Clone,
{
    fn deliver(&mut self, value: Option<&V>) {
        invoke_isolated(|| (self.callback)(value));

        self.delivered.set(value.cloned());
    }
}

// Containing the panic here is enough to keep the slot usable and the remaining consumers
// notified.
fn invoke_isolated(f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            panic = panic_message(payload.as_ref()),
            "value slot consumer panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

impl<V> Default for ValueSlot<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> From<V> for ValueSlot<V> {
    fn from(value: V) -> Self {
        Self::with_value(value)
    }
}

impl<V> fmt::Debug for ValueSlot<V>
where
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();

        f.debug_struct("ValueSlot")
            .field("value", &state.value)
            .field("single_consumers", &state.single.len())
            .field("persistent_consumers", &state.persistent.len())
            .finish()
    }
}

impl<V> fmt::Display for ValueSlot<V>
where
    V: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.state.lock().value.as_ref() {
            Some(value) => write!(f, "{value}"),
            None => f.write_str("<empty>"),
        }
    }
}
