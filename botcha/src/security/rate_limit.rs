//! Fixed-window request counting.
//!
//! Each caller gets one counter per hour. The counter lives in the
//! [`KvStore`], keyed by app when the caller identifies one and by client IP
//! otherwise, so all instances of a deployment share the same quota.
//!
//! # Window Semantics
//!
//! 1. First request, or more than an hour since `window_start`: reset to `count = 1`
//! 2. Otherwise: `count += 1`
//! 3. `allowed = count <= limit`
//!
//! The window resets outright rather than decaying. Storage failures fail open.
//!
//! # Examples
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
//! let limiter = RateLimiter::new(
//!     Arc::new(MemoryStore::new()),
//!     RateLimitConfig { requests_per_hour: 2 },
//! );
//!
//! assert!(limiter.check("198.51.100.4", None).await.allowed);
//! assert!(limiter.check("198.51.100.4", None).await.allowed);
//! assert!(!limiter.check("198.51.100.4", None).await.allowed);
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    clock::now_millis,
    error::{BotchaError, Result},
    reliability::fail_open,
    security::audit::{AuditEvent, AuditEventType, audit_log},
    store::{KvStore, get_json, put_json},
};

/// Length of one counting window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(3600);

#[allow(
    clippy::cast_possible_truncation,
    reason = "one hour in milliseconds fits u64"
)]
const WINDOW_MS: u64 = RATE_LIMIT_WINDOW.as_millis() as u64;

/// Rate limit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per caller per window (default: 100).
    pub requests_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_hour: 100 }
    }
}

/// Outcome of a single [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// When the current window ends, in epoch milliseconds.
    pub reset_at: u64,
    /// Seconds to wait before retrying. Set only when denied.
    pub retry_after: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowCounter {
    count: u32,
    window_start: u64,
}

/// Builds the store key for a caller: app-scoped when `app_id` is present
/// (shared by every client of that app), IP-scoped otherwise.
///
/// # Examples
///
/// ```
/// use botcha::security::rate_limit_key;
///
/// assert_eq!(rate_limit_key("203.0.113.9", Some("app_42")), "ratelimit:app:app_42");
/// assert_eq!(rate_limit_key("203.0.113.9", None), "ratelimit:ip:203.0.113.9");
/// ```
#[must_use]
pub fn rate_limit_key(client_ip: &str, app_id: Option<&str>) -> String {
    match app_id {
        Some(app) => format!("ratelimit:app:{app}"),
        None => format!("ratelimit:ip:{client_ip}"),
    }
}

/// Store-backed fixed-window rate limiter.
///
/// Without a store every request is allowed and `remaining` always equals the
/// limit; nothing persists between calls.
#[derive(Debug)]
pub struct RateLimiter<S> {
    store: Option<Arc<S>>,
    config: RateLimitConfig,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), config: self.config }
    }
}

impl<S: KvStore> RateLimiter<S> {
    /// Creates a limiter backed by `store`.
    #[must_use]
    pub fn new(store: Arc<S>, config: RateLimitConfig) -> Self {
        Self { store: Some(store), config }
    }

    /// Creates a limiter with no backing store (local/offline use).
    #[must_use]
    pub fn without_store(config: RateLimitConfig) -> Self {
        Self { store: None, config }
    }

    /// Configured per-window limit.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.config.requests_per_hour
    }

    /// Counts one request for the caller and reports whether it may proceed.
    #[instrument(skip(self), level = "debug")]
    pub async fn check(&self, client_ip: &str, app_id: Option<&str>) -> RateLimitDecision {
        let key = rate_limit_key(client_ip, app_id);
        let decision = self.check_key_at(&key, now_millis()).await;

        if !decision.allowed {
            warn!(key = %key, retry_after = ?decision.retry_after, "rate limit exceeded");
            let mut event =
                AuditEvent::new(AuditEventType::RateLimitExceeded, "anonymous", Uuid::new_v4())
                    .with_client_ip(client_ip);
            if let Some(app) = app_id {
                event = event.with_app_id(app);
            }
            audit_log(&event);
        }
        decision
    }

    /// Like [`check`](Self::check), but turns a denial into an error.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::RateLimited`] when the caller is over quota.
    pub async fn enforce(
        &self,
        client_ip: &str,
        app_id: Option<&str>,
    ) -> Result<RateLimitDecision> {
        let decision = self.check(client_ip, app_id).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(BotchaError::RateLimited { retry_after: decision.retry_after.unwrap_or(1) })
        }
    }

    pub(crate) async fn check_key_at(&self, key: &str, now: u64) -> RateLimitDecision {
        let limit = self.config.requests_per_hour;
        let fresh =
            RateLimitDecision {
                allowed: true,
                remaining: limit,
                reset_at: now + WINDOW_MS,
                retry_after: None,
            };

        let Some(store) = &self.store else {
            return fresh;
        };

        fail_open("rate_limit.check", record_hit(store.as_ref(), key, limit, now), fresh)
            .await
            .unwrap_or(fresh)
    }
}

async fn record_hit<S: KvStore>(
    store: &S,
    key: &str,
    limit: u32,
    now: u64,
) -> Result<RateLimitDecision> {
    let existing: Option<WindowCounter> = get_json(store, key).await?;

    let counter = match existing {
        Some(c) if now.saturating_sub(c.window_start) <= WINDOW_MS => {
            WindowCounter { count: c.count.saturating_add(1), window_start: c.window_start }
        }
        _ => WindowCounter { count: 1, window_start: now },
    };

    put_json(store, key, &counter, Some(RATE_LIMIT_WINDOW)).await?;

    let reset_at = counter.window_start + WINDOW_MS;
    let allowed = counter.count <= limit;
    let retry_after = (!allowed).then(|| {
        let wait_ms = reset_at.saturating_sub(now);
        wait_ms.div_ceil(1000).clamp(1, RATE_LIMIT_WINDOW.as_secs())
    });

    debug!(key, count = counter.count, limit, allowed, "rate limit counter updated");

    let remaining = limit.saturating_sub(counter.count);
    Ok(RateLimitDecision { allowed, remaining, reset_at, retry_after })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(limit: u32) -> (RateLimiter<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        let limiter =
            RateLimiter::new(Arc::new(store.clone()), RateLimitConfig { requests_per_hour: limit });
        (limiter, store)
    }

    #[test]
    fn test_default_config() {
        assert_eq!(RateLimitConfig::default().requests_per_hour, 100);
    }

    #[tokio::test]
    async fn test_sixth_request_denied() {
        let (limiter, _) = limiter(5);

        for i in 0..5 {
            let d = limiter.check("10.0.0.1", None).await;
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, 4 - i);
            assert_eq!(d.retry_after, None);
        }

        let denied = limiter.check("10.0.0.1", None).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after.is_some_and(|s| s > 0 && s <= 3600));

        // other keys are independent
        assert!(limiter.check("10.0.0.2", None).await.allowed);
    }

    #[tokio::test]
    async fn test_app_scope_ignores_ip() {
        let (limiter, _) = limiter(2);

        assert!(limiter.check("1.1.1.1", Some("app_a")).await.allowed);
        assert!(limiter.check("2.2.2.2", Some("app_a")).await.allowed);
        assert!(!limiter.check("3.3.3.3", Some("app_a")).await.allowed);

        // same IP without app id uses its own counter
        assert!(limiter.check("3.3.3.3", None).await.allowed);
    }

    #[tokio::test]
    async fn test_window_resets_after_an_hour() {
        let (limiter, _) = limiter(1);
        let start = 1_700_000_000_000;

        assert!(limiter.check_key_at("k", start).await.allowed);
        assert!(!limiter.check_key_at("k", start + 10).await.allowed);

        // exactly one window later is still the same window
        assert!(!limiter.check_key_at("k", start + WINDOW_MS).await.allowed);

        let after = limiter.check_key_at("k", start + WINDOW_MS + 1).await;
        assert!(after.allowed);
        assert_eq!(after.reset_at, start + 2 * WINDOW_MS + 1);
    }

    #[tokio::test]
    async fn test_retry_after_counts_down() {
        let (limiter, _) = limiter(1);
        let start = 1_700_000_000_000;

        limiter.check_key_at("k", start).await;
        let early = limiter.check_key_at("k", start + 1).await;
        let late = limiter.check_key_at("k", start + WINDOW_MS - 1_500).await;

        assert_eq!(early.retry_after, Some(3600));
        assert_eq!(late.retry_after, Some(2));
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (limiter, store) = limiter(1);
        store.set_unavailable(true);

        for _ in 0..3 {
            let d = limiter.check("10.0.0.1", None).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 1);
        }
    }

    #[tokio::test]
    async fn test_without_store_always_allows() {
        let limiter =
            RateLimiter::<MemoryStore>::without_store(RateLimitConfig { requests_per_hour: 1 });
        for _ in 0..10 {
            let d = limiter.check("10.0.0.1", None).await;
            assert!(d.allowed);
            assert_eq!(d.remaining, 1);
        }
    }

    #[tokio::test]
    async fn test_enforce_returns_error() {
        let (limiter, _) = limiter(1);
        limiter.enforce("10.0.0.1", None).await.unwrap();
        let err = limiter.enforce("10.0.0.1", None).await.unwrap_err();
        assert!(matches!(err, BotchaError::RateLimited { retry_after } if retry_after > 0));
    }

    #[tokio::test]
    async fn test_corrupt_counter_fails_open() {
        let (limiter, store) = limiter(1);
        store.put(&rate_limit_key("10.0.0.1", None), "garbage".into(), None).await.unwrap();
        assert!(limiter.check("10.0.0.1", None).await.allowed);
    }
}
