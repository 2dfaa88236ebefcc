//! Result fan-out: the result data model and the broadcaster.
//!
//! This module groups the test-run **data model** and the **broadcaster**
//! used to distribute results from plugin supervisors to every consumer.
//!
//! ## Contents
//! - [`TestRunResult`] — one synthetic-test iteration's outcome
//! - [`Broadcaster`], [`Subscription`], [`SubscriberHandle`] — non-blocking
//!   pub/sub with per-subscriber bounded queues and drop accounting
//!
//! ## Quick reference
//! - **Publisher**: each plugin run, through its
//!   [`ResultEmitter`](crate::plugins::ResultEmitter).
//! - **Consumers**: [`ExtStorageHandler`](crate::storage::ExtStorageHandler)
//!   (persists results) and
//!   [`PrometheusExporter`](crate::metrics::PrometheusExporter) (exports
//!   metrics); tests subscribe directly.

mod broadcaster;
mod result;

pub use broadcaster::{Broadcaster, SubscriberHandle, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
pub use result::TestRunResult;

pub(crate) use result::unix_seconds;
