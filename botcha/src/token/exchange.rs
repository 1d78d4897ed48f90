//! Trading a solved speed challenge for a token pair.

use tracing::instrument;

use super::service::{TokenPair, TokenRequest, TokenService};
use crate::{challenge::ChallengeEngine, error::Result, store::KvStore};

/// Context bound into the issued tokens.
#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    /// Audience for the `aud` claim.
    pub audience: Option<String>,
    /// Client IP for the `client_ip` claim.
    pub client_ip: Option<String>,
    /// Application id.
    pub app_id: Option<String>,
}

/// Verifies the speed challenge `id` (consuming it) and, on success, issues an
/// access/refresh pair whose subject is the challenge id.
///
/// # Errors
///
/// Any challenge verification error from
/// [`ChallengeEngine::verify_speed`], or a signing failure.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use botcha::{
///     challenge::{ChallengeEngine, solve_speed},
///     store::MemoryStore,
///     token::{ExchangeOptions, TokenService, exchange_solution},
/// };
///
/// # async fn example() -> botcha::error::Result<()> {
/// let engine = ChallengeEngine::new(Arc::new(MemoryStore::new()));
/// let tokens = TokenService::new(b"0123456789abcdef0123456789abcdef".to_vec())?;
///
/// let challenge = engine.issue_speed().await?;
/// let answers = solve_speed(&challenge.problems);
/// let pair =
///     exchange_solution(&engine, &tokens, &challenge.id, &answers, ExchangeOptions::default())
///         .await?;
/// assert_eq!(pair.expires_in, 300);
/// # Ok(())
/// # }
/// ```
#[instrument(skip(engine, tokens, answers, options))]
pub async fn exchange_solution<S: KvStore>(
    engine: &ChallengeEngine<S>,
    tokens: &TokenService,
    challenge_id: &str,
    answers: &[String],
    options: ExchangeOptions,
) -> Result<TokenPair> {
    let solved = engine.verify_speed(challenge_id, answers).await?;

    tokens.issue_pair(&TokenRequest {
        subject: challenge_id.to_owned(),
        solve_time_ms: solved.solve_time_ms,
        audience: options.audience,
        client_ip: options.client_ip,
        app_id: options.app_id,
    })
}
