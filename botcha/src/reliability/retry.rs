//! Exponential backoff for transient failures.

use std::time::Duration;

use crate::error::BotchaError;

/// Backoff parameters for [`retry_with_backoff`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use botcha::reliability::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_attempts: 2,
///     initial_delay: Duration::from_millis(50),
///     ..RetryPolicy::default()
/// };
/// assert_eq!(policy.max_attempts, 2);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3). Zero behaves like one.
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 100ms).
    pub initial_delay: Duration,
    /// Upper bound on any single delay (default: 2s).
    pub max_delay: Duration,
    /// Growth factor between consecutive delays (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        #[allow(
            clippy::cast_precision_loss,
            reason = "acceptable for duration calculations"
        )]
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss,
            clippy::cast_sign_loss,
            reason = "clamped to max_delay immediately after"
        )]
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are exhausted.
///
/// Retryability is decided by [`BotchaError::is_retryable`].
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once attempts run out.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, BotchaError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BotchaError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if error.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
