//! Failure handling for store and directory access.
//!
//! BOTCHA sits in front of other services, so an outage in one of its own
//! dependencies must not lock every agent out. Non-security bookkeeping (rate
//! limit counters, revocation lookups, directory caching, `last_verified_at`)
//! goes through [`fail_open`]; outbound directory fetches go through
//! [`retry_with_backoff`].

mod fail_open;
mod retry;

pub use fail_open::{fail_open, fail_open_or_default};
pub use retry::{RetryPolicy, retry_with_backoff};
