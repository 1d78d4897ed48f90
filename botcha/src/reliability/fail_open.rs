//! Fail-open wrapper for non-critical store and directory operations.

use uuid::Uuid;

use crate::{
    error::Result,
    security::audit::{AuditEvent, AuditEventType, audit_log},
};

/// Awaits `future`; if it fails with an infrastructure error, logs a warning,
/// emits a [`AuditEventType::FailOpen`] audit event, and returns `fallback`.
///
/// Caller errors (anything where
/// [`is_infrastructure`](crate::error::BotchaError::is_infrastructure) is
/// `false`) are propagated unchanged, so a wrapped security check still fails
/// closed on bad input.
///
/// # Errors
///
/// Returns the wrapped operation's error when it is not an infrastructure failure.
///
/// # Examples
///
/// ```
/// use botcha::{error::BotchaError, reliability::fail_open};
///
/// # async fn example() -> botcha::error::Result<()> {
/// let revoked = fail_open(
///     "revocation.check",
///     async { Err::<bool, _>(BotchaError::StorageUnavailable("timeout".into())) },
///     false,
/// )
/// .await?;
/// assert!(!revoked);
/// # Ok(())
/// # }
/// ```
pub async fn fail_open<T, F>(operation: &'static str, future: F, fallback: T) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match future.await {
        Ok(value) => Ok(value),
        Err(error) if error.is_infrastructure() => {
            tracing::warn!(operation, error = %error, "dependency unavailable, failing open");
            audit_log(
                &AuditEvent::new(AuditEventType::FailOpen, "system", Uuid::new_v4())
                    .with_operation(operation)
                    .with_error(error.to_string()),
            );
            Ok(fallback)
        }
        Err(error) => Err(error),
    }
}

/// [`fail_open`] with `T::default()` as the fallback, for operations whose only
/// useful output is their side effect.
///
/// # Errors
///
/// Same as [`fail_open`].
pub async fn fail_open_or_default<T, F>(operation: &'static str, future: F) -> Result<T>
where
    T: Default,
    F: Future<Output = Result<T>>,
{
    fail_open(operation, future, T::default()).await
}
