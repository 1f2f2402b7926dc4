//! Metrics for listener fan-out.
//!
//! The metrics use per-thread event instances to minimize contention.

use nm::Event;

thread_local! {
    /// Messages successfully delivered to a listener.
    pub(crate) static MESSAGES_DELIVERED: Event = Event::builder()
        .name("fanout_messages_delivered")
        .build();

    /// Failed delivery attempts, including attempts that are later retried.
    pub(crate) static DELIVERY_ERRORS: Event = Event::builder()
        .name("fanout_delivery_errors")
        .build();

    /// Listeners removed from a registry by the error policy.
    pub(crate) static LISTENERS_EVICTED: Event = Event::builder()
        .name("fanout_listeners_evicted")
        .build();
}
