use std::env;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::str::FromStr;
use std::sync::{Arc, Once};
use std::time::Duration;

use new_zealand::nz;
use shared_pool::{CallerThread, Executor, SharedPool};
use tracing::warn;

use crate::{DeliveryErrorPolicy, DeliverySettings, ErrorCountPolicy, ListenerRegistry, Shared};

const DEFAULT_MAX_BACKLOG: NonZero<usize> = nz!(100);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_BACKLOG_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Overrides the default maximum number of queued messages per listener.
pub const MAX_BACKLOG_ENV: &str = "FANOUT_MAX_BACKLOG";

/// Overrides the default delay applied to every dispatched message, in milliseconds.
pub const DEFAULT_DELAY_ENV: &str = "FANOUT_DEFAULT_DELAY_MS";

static DEFAULT_DELAY_WARNING: Once = Once::new();

/// Builder for configuring a [`ListenerRegistry`].
///
/// Without further configuration, messages are delivered synchronously on the dispatching
/// thread, failing listeners are evicted after three consecutive errors (retrying in between)
/// and each listener may have up to 100 queued messages.
#[must_use]
pub struct ListenerRegistryBuilder<L: ?Sized, A = ()> {
    executor: Arc<dyn Executor>,
    pool: Option<SharedPool>,
    policy: Arc<dyn DeliveryErrorPolicy<L>>,
    max_backlog: NonZero<usize>,
    delay: Duration,
    retry_delay: Duration,
    backlog_retry_delay: Duration,

    _attachment: PhantomData<fn() -> A>,
}

impl<L, A> ListenerRegistryBuilder<L, A>
where
    L: ?Sized + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        let delay =
            env_value::<u64>(DEFAULT_DELAY_ENV).map_or(Duration::ZERO, Duration::from_millis);

        if !delay.is_zero() {
            DEFAULT_DELAY_WARNING.call_once(|| {
                warn!(
                    delay_ms = delay.as_millis(),
                    "default delay is active for listener registries"
                );
            });
        }

        Self {
            executor: Arc::new(CallerThread),
            pool: None,
            policy: Arc::new(ErrorCountPolicy::default()),
            max_backlog: env_value(MAX_BACKLOG_ENV).unwrap_or(DEFAULT_MAX_BACKLOG),
            delay,
            retry_delay: DEFAULT_RETRY_DELAY,
            backlog_retry_delay: DEFAULT_BACKLOG_RETRY_DELAY,
            _attachment: PhantomData,
        }
    }

    /// Delivers messages using the given executor.
    ///
    /// Delayed messages are then timed by sleeping on the executor before delivery.
    pub fn executor<E>(mut self, executor: E) -> Self
    where
        E: Executor + 'static,
    {
        self.executor = Arc::new(executor);
        self.pool = None;
        self
    }

    /// Delivers messages in the background on the given pool.
    ///
    /// Delayed messages are timed by the pool's scheduler, so no worker is held up while a
    /// message waits.
    pub fn asynchronous(mut self, pool: &SharedPool) -> Self {
        self.executor = Arc::new(pool.clone());
        self.pool = Some(pool.clone());
        self
    }

    /// Sets the policy that handles failing and lagging listeners.
    pub fn error_policy<P>(mut self, policy: P) -> Self
    where
        P: DeliveryErrorPolicy<L> + 'static,
    {
        self.policy = Arc::new(policy);
        self
    }

    /// Sets how many messages may be queued for one listener before the backlog policy applies.
    pub fn max_backlog(mut self, max_backlog: NonZero<usize>) -> Self {
        self.max_backlog = max_backlog;
        self
    }

    /// Delays every dispatched message by `delay`. Each message is delayed individually.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the pause before a failed message is retried. Default is 1 second.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the pause before queueing into a full backlog is retried. Default is 10 ms.
    pub fn backlog_retry_delay(mut self, delay: Duration) -> Self {
        self.backlog_retry_delay = delay;
        self
    }

    /// Builds the registry.
    #[must_use]
    pub fn build(self) -> ListenerRegistry<L, A> {
        ListenerRegistry::from_shared(Shared::new(
            DeliverySettings {
                policy: self.policy,
                retry_delay: self.retry_delay,
                backlog_retry_delay: self.backlog_retry_delay,
            },
            self.executor,
            self.pool,
            self.delay,
            self.max_backlog,
        ))
    }
}

impl<L: ?Sized, A> fmt::Debug for ListenerRegistryBuilder<L, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistryBuilder")
            .field("asynchronous", &self.pool.is_some())
            .field("max_backlog", &self.max_backlog)
            .field("delay", &self.delay)
            .field("retry_delay", &self.retry_delay)
            .field("backlog_retry_delay", &self.backlog_retry_delay)
            .finish_non_exhaustive()
    }
}

fn env_value<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = env::var(name).ok()?;

    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(error) => {
            warn!(name, value = %value, %error, "ignoring invalid environment variable");
            None
        }
    }
}
