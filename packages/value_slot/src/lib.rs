#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A thread-safe single-value cell that threads can block on.
//!
//! [`ValueSlot`] is similar to an atomic reference but trades raw speed for a richer set of
//! synchronization operations:
//!
//! * Blocking waits for any value, for a specific value or for anything but a given value.
//! * Compare-and-set by equality or by an arbitrary predicate.
//! * Change notification to one-shot consumers ([`ValueSlot::consume_value`]) and to
//!   persistent consumers ([`ValueSlot::consume_all_values`]).
//!
//! It is intended as the hand-off primitive between threads: one thread parks until another
//! thread publishes a value into the slot.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! use value_slot::ValueSlot;
//!
//! let slot = Arc::new(ValueSlot::new());
//!
//! let producer = thread::spawn({
//!     let slot = Arc::clone(&slot);
//!     move || slot.set(Some("ready"))
//! });
//!
//! assert_eq!(
//!     slot.wait_for_value_timeout(Duration::from_secs(10)),
//!     Some("ready")
//! );
//! producer.join().unwrap();
//! ```
//!
//! # Consumers
//!
//! Consumer callbacks run synchronously on the thread that calls [`ValueSlot::set`], one change
//! at a time and in the order the changes happened. A consumer may read, change or unsubscribe
//! from the slot it is registered with. A change made by a consumer is delivered once the
//! current change has reached every consumer. A consumer must not block waiting for another
//! thread to change the same slot, as that thread waits for the delivery to finish.
//!
//! A panicking consumer is isolated: the panic is logged and the remaining consumers still
//! receive the value.

mod consumer;
mod latch;
mod slot;

pub use consumer::*;
pub(crate) use latch::*;
pub use slot::*;
