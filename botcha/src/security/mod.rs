//! Abuse controls and audit trail.
//!
//! # Rate Limiting
//!
//! [`RateLimiter`] counts requests per caller in fixed one-hour windows stored
//! in the shared [`KvStore`](crate::store::KvStore):
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use botcha::{
//!     security::{RateLimitConfig, RateLimiter},
//!     store::MemoryStore,
//! };
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), RateLimitConfig::default());
//! let decision = limiter.check("203.0.113.1", Some("app_demo")).await;
//! assert!(decision.allowed);
//! # }
//! ```
//!
//! # Audit Logging
//!
//! Security-relevant events are emitted on the `audit` tracing target:
//!
//! ```rust
//! use botcha::{audit, security::audit::AuditEventType};
//! use uuid::Uuid;
//!
//! audit!(
//!     AuditEventType::TokenRevoked,
//!     "challenge:abc",
//!     Uuid::new_v4(),
//!     with_token_id("8b1e...")
//! );
//! ```

pub mod audit;
mod rate_limit;

pub use audit::{AuditDetails, AuditEvent, AuditEventType, audit_log, redact_ip, redact_sensitive};
pub use rate_limit::{
    RATE_LIMIT_WINDOW, RateLimitConfig, RateLimitDecision, RateLimiter, rate_limit_key,
};
