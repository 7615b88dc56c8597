//! Fault-tolerant call wrappers
//!
//! Two decorators around a held peer handle:
//!
//! - [`Retry`] re-issues a call that failed with a transient error, a fixed
//!   number of times or indefinitely, sleeping between attempts.
//! - [`Failover`] drops a server handle whose call failed and asks the
//!   coordinator for a replacement.
//!
//! Both implement the same trait as the handle they wrap, so callers cannot
//! tell a retry or a replacement happened. They compose by construction:
//! `Retry::new(Arc::new(Failover::new(..)), ..)`.

pub mod failover;
pub mod retry;

pub use failover::Failover;
pub use retry::{Retry, RetryPolicy};
