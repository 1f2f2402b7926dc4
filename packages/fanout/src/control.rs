use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use shared_pool::panic_message;
use tracing::{debug, info, trace, warn};

use crate::metrics::{DELIVERY_ERRORS, LISTENERS_EVICTED, MESSAGES_DELIVERED};
use crate::{DeliveryError, DeliveryErrorPolicy, DeliveryStats, ErrorResponse, Message, Shared};

/// Delivery settings shared by every listener of one registry.
pub(crate) struct DeliverySettings<L: ?Sized> {
    pub(crate) policy: Arc<dyn DeliveryErrorPolicy<L>>,
    pub(crate) retry_delay: Duration,
    pub(crate) backlog_retry_delay: Duration,
}

impl<L: ?Sized> fmt::Debug for DeliverySettings<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliverySettings")
            .field("retry_delay", &self.retry_delay)
            .field("backlog_retry_delay", &self.backlog_retry_delay)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Counters {
    total_errors: u32,
    total_successes: u32,
    consecutive_errors: u32,

    // Set by the first `AccessDenied`. From then on, `AccessDenied` is fatal.
    elevated: bool,
}

/// Delivery state of one registered listener: its message queue, its error counters and the
/// logic that drains the queue into the listener.
///
/// Any number of threads may queue messages concurrently, but at most one worker drains the
/// queue at a time, so messages reach the listener in the order they were queued.
pub(crate) struct DispatchControl<L: ?Sized, A> {
    listener: Arc<L>,
    attachment: Option<A>,

    queue: ArrayQueue<Message<L>>,

    // Set while a worker is draining the queue or has been submitted to do so.
    worker_active: AtomicBool,

    evicted: AtomicBool,

    // Touched by dispatching threads, unlike the other counters.
    consecutive_backlog_errors: AtomicU32,

    // Only the active worker touches these.
    counters: Mutex<Counters>,

    settings: Arc<DeliverySettings<L>>,
    registry: Weak<Shared<L, A>>,
}

impl<L, A> DispatchControl<L, A>
where
    L: ?Sized + Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    pub(crate) fn new(
        listener: Arc<L>,
        attachment: Option<A>,
        capacity: usize,
        settings: Arc<DeliverySettings<L>>,
        registry: Weak<Shared<L, A>>,
    ) -> Self {
        Self {
            listener,
            attachment,
            queue: ArrayQueue::new(capacity),
            worker_active: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            consecutive_backlog_errors: AtomicU32::new(0),
            counters: Mutex::new(Counters::default()),
            settings,
            registry,
        }
    }

    pub(crate) fn listener(&self) -> &Arc<L> {
        &self.listener
    }

    pub(crate) fn attachment(&self) -> Option<&A> {
        self.attachment.as_ref()
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Queues a message for delivery, applying the backlog policy if the queue is full.
    ///
    /// Returns `true` if the caller must submit [`drain()`](Self::drain) to an executor.
    pub(crate) fn enqueue(&self, message: Message<L>) -> bool {
        let mut message = message;

        loop {
            if self.is_evicted() {
                return false;
            }

            match self.queue.push(message) {
                Ok(()) => {
                    self.consecutive_backlog_errors.store(0, Ordering::Relaxed);
                    break;
                }
                Err(rejected) => {
                    message = rejected;

                    let consecutive = self
                        .consecutive_backlog_errors
                        .fetch_add(1, Ordering::Relaxed)
                        .wrapping_add(1);
                    let backlog = self.queue.len();

                    let response = self.consult_policy("excessive_backlog", || {
                        self.settings
                            .policy
                            .excessive_backlog(&self.listener, backlog, consecutive)
                    });

                    debug!(
                        backlog,
                        consecutive_backlog_errors = consecutive,
                        ?response,
                        operation = message.operation(),
                        "listener queue is full"
                    );

                    match response {
                        ErrorResponse::EvictListener => {
                            self.evict();
                            return false;
                        }
                        ErrorResponse::DropMessage => return false,
                        ErrorResponse::RetryMessage => thread::sleep(self.settings.backlog_retry_delay),
                    }
                }
            }
        }

        self.worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the worker claim taken by [`enqueue()`](Self::enqueue) when the worker could not
    /// be submitted.
    pub(crate) fn worker_start_failed(&self) {
        self.worker_active.store(false, Ordering::Release);
    }

    /// Delivers queued messages until the queue is empty.
    #[cfg_attr(test, mutants::skip)] // Mutating the recheck only strands messages in the queue.
    pub(crate) fn drain(&self) {
        loop {
            self.deliver_queued();

            self.worker_active.store(false, Ordering::Release);

            // A message queued after our last pop but before the flag was cleared saw an active
            // worker and did not start one.
            if self.queue.is_empty()
                || self
                    .worker_active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
        }
    }

    fn deliver_queued(&self) {
        let mut retry: Option<Message<L>> = None;

        loop {
            if self.is_evicted() {
                return;
            }

            let Some(message) = retry.take().or_else(|| self.queue.pop()) else {
                return;
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| message.deliver(&self.listener)))
                .unwrap_or_else(|payload| {
                    Err(DeliveryError::Panicked(
                        panic_message(payload.as_ref()).to_string(),
                    ))
                });

            let error = match outcome {
                Ok(()) => {
                    let mut counters = self.counters.lock();
                    counters.total_successes = counters.total_successes.wrapping_add(1);
                    counters.consecutive_errors = 0;

                    MESSAGES_DELIVERED.with(|e| e.observe_once());
                    continue;
                }
                Err(error) => error,
            };

            DELIVERY_ERRORS.with(|e| e.observe_once());

            let stats = {
                let mut counters = self.counters.lock();

                if error == DeliveryError::AccessDenied && !counters.elevated {
                    counters.elevated = true;
                    trace!(
                        operation = message.operation(),
                        "listener denied access, retrying with elevated access"
                    );
                    retry = Some(message);
                    continue;
                }

                counters.total_errors = counters.total_errors.wrapping_add(1);
                counters.consecutive_errors = counters.consecutive_errors.wrapping_add(1);

                DeliveryStats {
                    total_errors: counters.total_errors,
                    total_successes: counters.total_successes,
                    consecutive_errors: counters.consecutive_errors,
                    fatal: error.is_fatal() || error == DeliveryError::AccessDenied,
                }
            };

            let response = self.consult_policy("delivery_error", || {
                self.settings
                    .policy
                    .delivery_error(&self.listener, &error, &stats)
            });

            let response = if stats.fatal {
                ErrorResponse::EvictListener
            } else {
                response
            };

            debug!(
                %error,
                ?response,
                operation = message.operation(),
                consecutive_errors = stats.consecutive_errors,
                "message delivery failed"
            );

            match response {
                ErrorResponse::DropMessage => {}
                ErrorResponse::RetryMessage => {
                    thread::sleep(self.settings.retry_delay);
                    retry = Some(message);
                }
                ErrorResponse::EvictListener => {
                    self.evict();
                    return;
                }
            }
        }
    }

    fn consult_policy(
        &self,
        callback: &'static str,
        f: impl FnOnce() -> ErrorResponse,
    ) -> ErrorResponse {
        panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
            warn!(
                callback,
                panic = panic_message(payload.as_ref()),
                "delivery error policy panicked, dropping the message"
            );
            ErrorResponse::DropMessage
        })
    }

    /// Removes the listener from its registry and discards its queued messages.
    pub(crate) fn evict(&self) {
        if self.evicted.swap(true, Ordering::AcqRel) {
            return;
        }

        let was_last = self
            .registry
            .upgrade()
            .is_some_and(|registry| registry.remove_control(self));

        let mut discarded = 0_usize;
        while self.queue.pop().is_some() {
            discarded = discarded.wrapping_add(1);
        }

        LISTENERS_EVICTED.with(|e| e.observe_once());
        info!(discarded, was_last, "listener evicted");

        if was_last {
            let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                self.settings.policy.last_listener_removed();
            }));

            if let Err(payload) = notified {
                warn!(
                    panic = panic_message(payload.as_ref()),
                    "delivery error policy panicked in last_listener_removed"
                );
            }
        }
    }
}

impl<L: ?Sized, A> fmt::Debug for DispatchControl<L, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchControl")
            .field("backlog", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .field("worker_active", &self.worker_active.load(Ordering::Relaxed))
            .field("evicted", &self.evicted.load(Ordering::Relaxed))
            .field("counters", &*self.counters.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;

    use super::*;

    trait Sink: Send + Sync {
        fn accept(&self, value: u32) -> Result<(), DeliveryError>;
    }

    /// Records accepted values and fails with the scripted errors first.
    #[derive(Default)]
    struct ScriptedSink {
        accepted: Mutex<Vec<u32>>,
        failures: Mutex<Vec<DeliveryError>>,
    }

    impl ScriptedSink {
        fn failing_with(failures: impl IntoIterator<Item = DeliveryError>) -> Self {
            let mut failures = failures.into_iter().collect::<Vec<_>>();
            failures.reverse();

            Self {
                accepted: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
            }
        }
    }

    impl Sink for ScriptedSink {
        fn accept(&self, value: u32) -> Result<(), DeliveryError> {
            if let Some(error) = self.failures.lock().pop() {
                return Err(error);
            }

            self.accepted.lock().push(value);
            Ok(())
        }
    }

    /// Answers delivery errors with a fixed response and records what it was told.
    struct RecordingPolicy {
        response: ErrorResponse,
        backlog_response: ErrorResponse,
        seen: Mutex<Vec<DeliveryStats>>,
        backlog_calls: AtomicUsize,
        panic_on_error: bool,
    }

    impl RecordingPolicy {
        fn new(response: ErrorResponse) -> Self {
            Self {
                response,
                backlog_response: ErrorResponse::EvictListener,
                seen: Mutex::new(Vec::new()),
                backlog_calls: AtomicUsize::new(0),
                panic_on_error: false,
            }
        }
    }

    impl DeliveryErrorPolicy<dyn Sink> for RecordingPolicy {
        fn delivery_error(
            &self,
            _listener: &dyn Sink,
            _error: &DeliveryError,
            stats: &DeliveryStats,
        ) -> ErrorResponse {
            self.seen.lock().push(*stats);

            assert!(!self.panic_on_error, "policy failure");

            self.response
        }

        fn excessive_backlog(
            &self,
            _listener: &dyn Sink,
            _backlog: usize,
            _consecutive_backlog_errors: u32,
        ) -> ErrorResponse {
            self.backlog_calls.fetch_add(1, Ordering::Relaxed);
            self.backlog_response
        }
    }

    fn control(
        sink: &Arc<ScriptedSink>,
        policy: &Arc<RecordingPolicy>,
        capacity: usize,
    ) -> DispatchControl<dyn Sink, ()> {
        let listener: Arc<dyn Sink> = Arc::clone(sink) as Arc<dyn Sink>;
        let policy: Arc<dyn DeliveryErrorPolicy<dyn Sink>> =
            Arc::clone(policy) as Arc<dyn DeliveryErrorPolicy<dyn Sink>>;

        DispatchControl::new(
            listener,
            None,
            capacity,
            Arc::new(DeliverySettings {
                policy,
                retry_delay: Duration::ZERO,
                backlog_retry_delay: Duration::ZERO,
            }),
            Weak::new(),
        )
    }

    fn accept(value: u32) -> Message<dyn Sink> {
        Message::new("accept", move |sink: &(dyn Sink + 'static)| sink.accept(value))
    }

    assert_impl_all!(DispatchControl<dyn Sink, ()>: Send, Sync);

    #[test]
    fn first_message_claims_worker_and_drain_delivers_in_order() {
        let sink = Arc::new(ScriptedSink::default());
        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::DropMessage));
        let control = control(&sink, &policy, 10);

        assert!(control.enqueue(accept(1)));
        assert!(!control.enqueue(accept(2)));
        assert!(!control.enqueue(accept(3)));

        control.drain();

        assert_eq!(*sink.accepted.lock(), vec![1, 2, 3]);

        // The worker claim was released.
        assert!(control.enqueue(accept(4)));
    }

    #[test]
    fn worker_start_failure_releases_claim() {
        let sink = Arc::new(ScriptedSink::default());
        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::DropMessage));
        let control = control(&sink, &policy, 10);

        assert!(control.enqueue(accept(1)));
        control.worker_start_failed();

        assert!(control.enqueue(accept(2)));
    }

    #[test]
    fn full_queue_consults_backlog_policy_and_evicts() {
        let sink = Arc::new(ScriptedSink::default());
        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::DropMessage));
        let control = control(&sink, &policy, 2);

        assert!(control.enqueue(accept(1)));
        assert!(!control.enqueue(accept(2)));
        assert!(!control.enqueue(accept(3)));

        assert_eq!(policy.backlog_calls.load(Ordering::Relaxed), 1);
        assert!(control.is_evicted());

        // An evicted listener receives nothing more.
        control.drain();
        assert!(sink.accepted.lock().is_empty());
        assert!(!control.enqueue(accept(4)));
    }

    #[test]
    fn full_queue_can_drop_message() {
        let sink = Arc::new(ScriptedSink::default());
        let mut policy = RecordingPolicy::new(ErrorResponse::DropMessage);
        policy.backlog_response = ErrorResponse::DropMessage;
        let policy = Arc::new(policy);
        let control = control(&sink, &policy, 1);

        assert!(control.enqueue(accept(1)));
        assert!(!control.enqueue(accept(2)));
        assert!(!control.is_evicted());

        control.drain();
        assert_eq!(*sink.accepted.lock(), vec![1]);
    }

    #[test]
    fn retry_response_redelivers_same_message() {
        let sink = Arc::new(ScriptedSink::failing_with([DeliveryError::Failed(
            "busy".to_string(),
        )]));
        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::RetryMessage));
        let control = control(&sink, &policy, 10);

        control.enqueue(accept(7));
        control.enqueue(accept(8));
        control.drain();

        assert_eq!(*sink.accepted.lock(), vec![7, 8]);
        assert_eq!(
            *policy.seen.lock(),
            vec![DeliveryStats {
                total_errors: 1,
                total_successes: 0,
                consecutive_errors: 1,
                fatal: false,
            }]
        );
    }

    #[test]
    fn drop_response_skips_message_and_success_resets_consecutive_count() {
        let sink = Arc::new(ScriptedSink::failing_with([
            DeliveryError::Failed("first".to_string()),
            DeliveryError::Failed("second".to_string()),
        ]));
        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::DropMessage));
        let control = control(&sink, &policy, 10);

        for value in 1..=4 {
            control.enqueue(accept(value));
        }
        control.drain();

        assert_eq!(*sink.accepted.lock(), vec![3, 4]);

        let seen = policy.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].consecutive_errors, 2);
        assert_eq!(seen[1].total_errors, 2);
    }

    #[test]
    fn access_denied_is_retried_once_then_fatal() {
        let sink = Arc::new(ScriptedSink::failing_with([DeliveryError::AccessDenied]));
        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::DropMessage));
        let control = control(&sink, &policy, 10);

        control.enqueue(accept(1));
        control.drain();

        // The elevated retry succeeded without involving the policy.
        assert_eq!(*sink.accepted.lock(), vec![1]);
        assert!(policy.seen.lock().is_empty());

        sink.failures.lock().push(DeliveryError::AccessDenied);
        control.enqueue(accept(2));
        control.drain();

        assert!(control.is_evicted());
        assert!(policy.seen.lock()[0].fatal);
    }

    #[test]
    fn fatal_error_evicts_even_if_policy_retries() {
        let sink = Arc::new(ScriptedSink::failing_with([DeliveryError::Fatal(
            "closed".to_string(),
        )]));
        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::RetryMessage));
        let control = control(&sink, &policy, 10);

        control.enqueue(accept(1));
        control.enqueue(accept(2));
        control.drain();

        assert!(control.is_evicted());
        assert!(sink.accepted.lock().is_empty());
    }

    #[test]
    fn panicking_listener_is_fatal() {
        struct Panicking;

        impl Sink for Panicking {
            fn accept(&self, _value: u32) -> Result<(), DeliveryError> {
                panic!("listener failure");
            }
        }

        let policy = Arc::new(RecordingPolicy::new(ErrorResponse::RetryMessage));
        let policy_dyn: Arc<dyn DeliveryErrorPolicy<dyn Sink>> =
            Arc::clone(&policy) as Arc<dyn DeliveryErrorPolicy<dyn Sink>>;

        let control: DispatchControl<dyn Sink, ()> = DispatchControl::new(
            Arc::new(Panicking),
            None,
            10,
            Arc::new(DeliverySettings {
                policy: policy_dyn,
                retry_delay: Duration::ZERO,
                backlog_retry_delay: Duration::ZERO,
            }),
            Weak::new(),
        );

        control.enqueue(accept(1));
        control.drain();

        assert!(control.is_evicted());
        assert!(policy.seen.lock()[0].fatal);
    }

    #[test]
    fn panicking_policy_drops_message() {
        let sink = Arc::new(ScriptedSink::failing_with([DeliveryError::Failed(
            "busy".to_string(),
        )]));
        let mut policy = RecordingPolicy::new(ErrorResponse::RetryMessage);
        policy.panic_on_error = true;
        let policy = Arc::new(policy);
        let control = control(&sink, &policy, 10);

        control.enqueue(accept(1));
        control.enqueue(accept(2));
        control.drain();

        assert_eq!(*sink.accepted.lock(), vec![2]);
        assert!(!control.is_evicted());
    }
}
