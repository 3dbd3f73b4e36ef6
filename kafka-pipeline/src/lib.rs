//! Kafka pipeline framework.
//!
//! Declare what should happen to the messages of a topic (buffer, parallelize,
//! batch, retry, commit) as a `PolicySet`, either through the builder or an
//! inline configuration string, and the framework assembles a backpressured
//! stage pipeline that keeps per-partition ordering and commits at-least-once.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`: full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`: full chain with `Caused by:` sections (Debug).
//!
//! Avoid `{}` / `%e` (Display) for errors, they only show the top-level message and hide the chain.

pub mod config;
pub mod error;
pub mod kafka;
pub mod pipelines;
pub mod policy;
pub mod subscription;

// Re-export commonly used types for convenience
pub use error::{ConfigError, SubscribeError, TransportError};
pub use kafka::{Batch, Message};
pub use pipelines::{handler_fn, Action, Handler};
pub use policy::{GroupBy, PolicySet, RetryPolicy};
pub use subscription::{Subscription, SubscriptionManager, SubscriptionRequest};
