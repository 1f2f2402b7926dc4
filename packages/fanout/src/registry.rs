use std::fmt;
use std::num::NonZero;
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use shared_pool::{Executor, SharedPool};
use tracing::{trace, warn};

use crate::{
    DeliveryOutcome, DeliverySettings, DispatchControl, ListenerRegistryBuilder, Message,
};

type FilterFn<L, A> = dyn Fn(Option<&A>, &Message<L>) -> bool + Send + Sync;

struct Filter<L: ?Sized, A>(Box<FilterFn<L, A>>);

/// Listeners are identified by the address of their shared allocation.
fn listener_key<L: ?Sized>(listener: &L) -> usize {
    ptr::from_ref(listener).cast::<()>().addr()
}

/// State shared by all handles to one registry and by the dispatch controls of its listeners.
pub(crate) struct Shared<L: ?Sized, A> {
    listeners: Mutex<HashMap<usize, Arc<DispatchControl<L, A>>>>,
    filter: ArcSwapOption<Filter<L, A>>,

    settings: Arc<DeliverySettings<L>>,
    executor: Arc<dyn Executor>,

    // Present for asynchronous registries. Delayed messages are then timed by its scheduler.
    pool: Option<SharedPool>,

    delay: Duration,
    max_backlog: NonZero<usize>,
}

impl<L, A> Shared<L, A>
where
    L: ?Sized + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    pub(crate) fn new(
        settings: DeliverySettings<L>,
        executor: Arc<dyn Executor>,
        pool: Option<SharedPool>,
        delay: Duration,
        max_backlog: NonZero<usize>,
    ) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            filter: ArcSwapOption::const_empty(),
            settings: Arc::new(settings),
            executor,
            pool,
            delay,
            max_backlog,
        }
    }

    /// Removes the control if it is still the registered one for its listener. Returns `true` if
    /// this emptied the registry.
    pub(crate) fn remove_control(&self, control: &DispatchControl<L, A>) -> bool {
        let mut listeners = self.listeners.lock();
        let key = listener_key(&**control.listener());

        let is_registered = listeners
            .get(&key)
            .is_some_and(|registered| ptr::eq(Arc::as_ptr(registered), control));

        if !is_registered {
            return false;
        }

        listeners.remove(&key);
        listeners.is_empty()
    }

    fn send(self: &Arc<Self>, message: Message<L>) {
        if self.delay.is_zero() {
            self.fan_out(&message);
            return;
        }

        let shared = Arc::clone(self);

        if let Some(pool) = &self.pool {
            let operation = message.operation();
            let handle = pool.schedule_once(move || shared.fan_out(&message), self.delay);

            // Dropping the handle does not cancel the delivery. A shut down pool completes it
            // right away.
            if let Some(Err(error)) = handle.try_get() {
                warn!(%error, operation, "unable to schedule delayed message");
            }

            return;
        }

        let delay = self.delay;
        let operation = message.operation();

        let result = self.executor.execute(Box::new(move || {
            thread::sleep(delay);
            shared.fan_out(&message);
        }));

        if let Err(error) = result {
            warn!(%error, operation, "unable to submit delayed message");
        }
    }

    fn fan_out(&self, message: &Message<L>) {
        // Listeners added or removed by the deliveries below do not affect this message.
        let snapshot = self
            .listeners
            .lock()
            .values()
            .cloned()
            .collect::<Vec<_>>();

        let filter = self.filter.load_full();

        trace!(
            listeners = snapshot.len(),
            operation = message.operation(),
            "fanning out message"
        );

        for control in snapshot {
            if let Some(filter) = &filter {
                if !(filter.0)(control.attachment(), message) {
                    continue;
                }
            }

            if !control.enqueue(message.clone()) {
                continue;
            }

            let worker = Arc::clone(&control);

            if let Err(error) = self.executor.execute(Box::new(move || worker.drain())) {
                warn!(
                    %error,
                    operation = message.operation(),
                    "unable to start listener delivery worker"
                );
                control.worker_start_failed();
            }
        }
    }
}

impl<L: ?Sized, A> fmt::Debug for Shared<L, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("listeners", &self.listeners.lock().len())
            .field("has_filter", &self.filter.load().is_some())
            .field("settings", &self.settings)
            .field("asynchronous", &self.pool.is_some())
            .field("delay", &self.delay)
            .field("max_backlog", &self.max_backlog)
            .finish_non_exhaustive()
    }
}

/// A set of listeners that calls are fanned out to.
///
/// Each listener gets its own bounded queue of pending messages, drained by at most one worker
/// at a time on the registry's executor. A listener therefore sees messages in the order they
/// were dispatched, while a slow or failing listener never holds up the others (unless the
/// executor is [`CallerThread`][shared_pool::CallerThread], in which case every delivery
/// happens synchronously on the dispatching thread).
///
/// Listeners that fail or fall behind are handled by the registry's
/// [`DeliveryErrorPolicy`][crate::DeliveryErrorPolicy]: failed messages are retried or dropped
/// and persistent failures evict the listener.
///
/// Listeners are identified by their `Arc` allocation: adding the same `Arc` twice registers it
/// once, while two separate allocations are two listeners even if they compare equal.
///
/// The registry is a cheaply cloneable handle. All clones share the same listeners.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// use fanout::ListenerRegistry;
///
/// trait TemperatureListener: Send + Sync {
///     fn temperature_changed(&self, celsius: i32);
/// }
///
/// #[derive(Default)]
/// struct Display {
///     updates: AtomicU32,
/// }
///
/// impl TemperatureListener for Display {
///     fn temperature_changed(&self, _celsius: i32) {
///         self.updates.fetch_add(1, Ordering::Relaxed);
///     }
/// }
///
/// let registry = ListenerRegistry::<dyn TemperatureListener>::new();
///
/// let display = Arc::new(Display::default());
/// let listener: Arc<dyn TemperatureListener> = display.clone();
/// registry.add(&listener);
///
/// registry
///     .dispatch()
///     .call("temperature_changed", |l| l.temperature_changed(21));
///
/// // The default executor delivers on the calling thread.
/// assert_eq!(display.updates.load(Ordering::Relaxed), 1);
/// ```
pub struct ListenerRegistry<L: ?Sized, A = ()> {
    shared: Arc<Shared<L, A>>,
}

impl<L, A> ListenerRegistry<L, A>
where
    L: ?Sized + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    /// Creates a registry with default settings: synchronous delivery on the dispatching
    /// thread and the default [`ErrorCountPolicy`][crate::ErrorCountPolicy].
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring a registry.
    #[must_use]
    pub fn builder() -> ListenerRegistryBuilder<L, A> {
        ListenerRegistryBuilder::new()
    }

    pub(crate) fn from_shared(shared: Shared<L, A>) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Registers a listener without an attachment. Does nothing if it is already registered.
    pub fn add(&self, listener: &Arc<L>) {
        self.insert(listener, None);
    }

    /// Registers a listener with an attachment that filters can inspect. Does nothing if the
    /// listener is already registered, in which case the existing attachment is kept.
    pub fn add_with_attachment(&self, listener: &Arc<L>, attachment: A) {
        self.insert(listener, Some(attachment));
    }

    fn insert(&self, listener: &Arc<L>, attachment: Option<A>) {
        let mut listeners = self.shared.listeners.lock();

        listeners
            .entry(listener_key(&**listener))
            .or_insert_with(|| {
                Arc::new(DispatchControl::new(
                    Arc::clone(listener),
                    attachment,
                    self.shared.max_backlog.get(),
                    Arc::clone(&self.shared.settings),
                    Arc::downgrade(&self.shared),
                ))
            });
    }

    /// Unregisters a listener.
    ///
    /// Returns `true` if the listener was registered and removing it left the registry empty.
    /// Messages already queued for the listener may still be delivered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.shared.listeners.lock();

        listeners.remove(&listener_key(&**listener)).is_some() && listeners.is_empty()
    }

    /// Unregisters every listener.
    pub fn remove_all(&self) {
        self.shared.listeners.lock().clear();
    }

    /// Whether any listener is registered.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.shared.listeners.lock().is_empty()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.listeners.lock().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_listeners()
    }

    /// Sets a filter that decides, per listener, whether a message is queued for it.
    ///
    /// The filter sees the listener's attachment and the message. Messages it rejects are
    /// skipped silently and do not count towards the listener's delivery statistics.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(Option<&A>, &Message<L>) -> bool + Send + Sync + 'static,
    {
        self.shared
            .filter
            .store(Some(Arc::new(Filter(Box::new(filter)))));
    }

    /// Removes the filter, if any.
    pub fn clear_filter(&self) {
        self.shared.filter.store(None);
    }

    /// Returns a handle that fans calls out to the registered listeners.
    #[must_use]
    pub fn dispatch(&self) -> Dispatch<L, A> {
        Dispatch {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L, A> ListenerRegistry<L, A>
where
    L: ?Sized + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    /// Returns the attachment the listener was registered with, if it is registered and has one.
    #[must_use]
    pub fn attachment(&self, listener: &Arc<L>) -> Option<A> {
        self.shared
            .listeners
            .lock()
            .get(&listener_key(&**listener))
            .and_then(|control| control.attachment().cloned())
    }
}

impl<L, A> Default for ListenerRegistry<L, A>
where
    L: ?Sized + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized, A> Clone for ListenerRegistry<L, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: ?Sized, A> fmt::Debug for ListenerRegistry<L, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("shared", &self.shared)
            .finish()
    }
}

/// Fans calls out to every listener registered at the time of the call.
///
/// Obtained from [`ListenerRegistry::dispatch()`]. Dispatching never fails from the caller's
/// point of view: delivery problems are handled by the registry's error policy and executor
/// rejections are logged.
pub struct Dispatch<L: ?Sized, A = ()> {
    shared: Arc<Shared<L, A>>,
}

impl<L, A> Dispatch<L, A>
where
    L: ?Sized + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    /// Calls `operation` on every listener, through `invoke`.
    ///
    /// `invoke` captures the arguments of the call and is invoked once per listener.
    pub fn call<F, O>(&self, operation: &'static str, invoke: F)
    where
        F: Fn(&L) -> O + Send + Sync + 'static,
        O: DeliveryOutcome,
    {
        self.send(Message::new(operation, invoke));
    }

    /// Delivers a prepared message to every listener.
    pub fn send(&self, message: Message<L>) {
        self.shared.send(message);
    }
}

impl<L: ?Sized, A> Clone for Dispatch<L, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: ?Sized, A> fmt::Debug for Dispatch<L, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("shared", &self.shared)
            .finish()
    }
}
