#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Fans calls out to a set of registered listeners, each with its own delivery queue.
//!
//! A [`ListenerRegistry`] holds listeners of some listener type `L` (typically a trait object
//! such as `dyn MyListener`) together with an optional attachment of type `A` per listener.
//! Calling an operation through [`ListenerRegistry::dispatch()`] captures the call as a
//! [`Message`] and queues it for every registered listener:
//!
//! * Each listener has a bounded queue drained by at most one worker at a time, so every
//!   listener sees messages in dispatch order. There is no ordering across listeners.
//! * Delivery runs on the registry's executor: synchronously on the dispatching thread by
//!   default, or in the background on a [`SharedPool`][shared_pool::SharedPool].
//! * Failed deliveries and full queues are handed to a [`DeliveryErrorPolicy`], which decides
//!   whether to retry the message, drop it or evict the listener. [`ErrorCountPolicy`] evicts a
//!   listener after a number of consecutive errors.
//! * A filter can skip listeners per message, based on their attachment.
//! * Every message can be delayed by a fixed duration.
//!
//! Only operations that return `()` or `Result<(), DeliveryError>` can be dispatched, since a
//! fan-out call has no single result to return.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use fanout::{DeliveryError, ErrorCountPolicy, ListenerRegistry};
//! use shared_pool::SharedPool;
//!
//! trait JobListener: Send + Sync {
//!     fn job_finished(&self, id: u64) -> Result<(), DeliveryError>;
//! }
//!
//! struct Audit;
//!
//! impl JobListener for Audit {
//!     fn job_finished(&self, id: u64) -> Result<(), DeliveryError> {
//!         println!("job {id} finished");
//!         Ok(())
//!     }
//! }
//!
//! let pool = SharedPool::new();
//!
//! let registry = ListenerRegistry::<dyn JobListener>::builder()
//!     .asynchronous(&pool)
//!     .error_policy(ErrorCountPolicy::new(5))
//!     .build();
//!
//! let audit: Arc<dyn JobListener> = Arc::new(Audit);
//! registry.add(&audit);
//!
//! registry.dispatch().call("job_finished", |l| l.job_finished(17));
//! ```
//!
//! # Configuration
//!
//! The `FANOUT_MAX_BACKLOG` and `FANOUT_DEFAULT_DELAY_MS` environment variables override the
//! default backlog limit and message delay of new registries.

mod builder;
mod control;
mod error;
mod message;
mod metrics;
mod policy;
mod registry;

pub use builder::*;
pub(crate) use control::*;
pub use error::*;
pub use message::*;
pub use policy::*;
pub use registry::*;
