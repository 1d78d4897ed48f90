//! Error types for BOTCHA.
//!
//! Every fallible operation in this crate returns [`Result`], whose error type is
//! [`BotchaError`]. Variants carry enough context to be rendered to the caller,
//! and each one maps to a stable machine-readable code via [`BotchaError::kind`].
//!
//! # Error Categories
//!
//! - **Challenge errors** ([`BotchaError::ChallengeNotFound`],
//!   [`BotchaError::ChallengeTooSlow`], [`BotchaError::WrongAnswer`]): the
//!   caller failed to prove it is an agent
//! - **Token errors** ([`BotchaError::TokenExpired`], [`BotchaError::TokenInvalid`],
//!   [`BotchaError::TokenRevoked`]): bearer credentials were rejected
//! - **Signature errors** ([`BotchaError::SignatureInvalid`],
//!   [`BotchaError::UntrustedProvider`], [`BotchaError::SignatureReplayed`]):
//!   RFC 9421 verification failed
//! - **Infrastructure errors** ([`BotchaError::StorageUnavailable`],
//!   [`BotchaError::DirectoryUnavailable`], [`BotchaError::HttpError`]): a
//!   dependency was unreachable; see [`BotchaError::is_infrastructure`]
//!
//! # Examples
//!
//! ```
//! use botcha::error::{BotchaError, Result};
//!
//! fn parse_difficulty(raw: &str) -> Result<u32> {
//!     raw.parse()
//!         .map_err(|_| BotchaError::InvalidInput(format!("not a number: {raw}")))
//! }
//!
//! assert!(parse_difficulty("x").is_err());
//! ```

use thiserror::Error;

/// Result type alias for BOTCHA operations.
pub type Result<T> = std::result::Result<T, BotchaError>;

/// Errors that can occur while issuing or verifying agent credentials.
///
/// # Error Recovery
///
/// - **Caller errors** (wrong answers, bad signatures, expired tokens): the caller
///   must fetch a new challenge or re-sign the request
/// - **Infrastructure errors** ([`is_infrastructure`](Self::is_infrastructure)):
///   retry later; several operations fail open on these instead of surfacing them
/// - **Rate limiting** ([`RateLimited`](Self::RateLimited)): wait `retry_after` seconds
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum BotchaError {
    /// No live challenge exists under the given id.
    ///
    /// Either the id was never issued, its TTL elapsed, or it was already consumed
    /// by an earlier verification attempt. Challenges are single-use.
    #[error("challenge not found or expired")]
    ChallengeNotFound,

    /// The answers arrived after the time limit plus network grace.
    #[error("too slow: took {elapsed_ms}ms, limit was {limit_ms}ms")]
    ChallengeTooSlow {
        /// Milliseconds between issuance and verification.
        elapsed_ms: u64,
        /// Advertised time limit in milliseconds (grace not included).
        limit_ms: u64,
    },

    /// At least one answer did not match the expected value.
    #[error("wrong answer")]
    WrongAnswer,

    /// The answers were structurally wrong (for example, the wrong count).
    #[error("invalid answer format: {0}")]
    InvalidAnswerFormat(String),

    /// The token's `exp` claim is in the past.
    #[error("token expired")]
    TokenExpired,

    /// The token is malformed or its signature does not verify.
    ///
    /// # Recovery
    ///
    /// Obtain a fresh token by solving a new challenge.
    #[error("invalid token: {0}")]
    TokenInvalid(String),

    /// The token is valid but of the wrong type (e.g. a refresh token used for access).
    #[error("invalid token type")]
    TokenInvalidType,

    /// The token's audience does not match the expected audience.
    #[error("invalid token audience")]
    TokenInvalidAudience,

    /// The token is bound to a client IP other than the caller's.
    #[error("token client IP mismatch")]
    TokenIpMismatch,

    /// The token's identifier was explicitly revoked.
    #[error("token revoked")]
    TokenRevoked,

    /// The refresh token could not be used to mint a new access token.
    #[error("invalid refresh token: {0}")]
    InvalidRefreshToken(String),

    /// The request carries neither `Signature` nor `Signature-Input`, or only one of them.
    #[error("missing Signature or Signature-Input header")]
    SignatureMissingHeaders,

    /// `Signature-Input` could not be parsed or references unavailable components.
    #[error("invalid Signature-Input: {0}")]
    InvalidSignatureInput(String),

    /// The key directory host is not on the trusted allow-list.
    #[error("untrusted key provider: {0}")]
    UntrustedProvider(String),

    /// The key directory URL is malformed or not HTTPS.
    #[error("invalid directory URL: {0}")]
    InvalidDirectoryUrl(String),

    /// The key directory could not be fetched or decoded.
    ///
    /// # Recovery
    ///
    /// Transient. The signature is rejected for this request only.
    #[error("key directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The directory was fetched but holds no key with the requested `keyid`.
    #[error("signing key not found in directory: {0}")]
    SignatureKeyNotFound(String),

    /// The signature did not verify against the resolved public key.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The signature's `expires` is in the past or `created` is too old.
    #[error("signature expired")]
    SignatureExpired,

    /// The signature's nonce has already been seen.
    #[error("signature nonce replayed")]
    SignatureReplayed,

    /// The signature algorithm is not one this verifier supports.
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The agent lacks a capability for the requested action.
    #[error("insufficient capability for action: {0}")]
    InsufficientCapability(String),

    /// A matching capability exists but one of its restrictions forbids the intent.
    #[error("capability restriction violated: {0}")]
    RestrictionViolated(String),

    /// No agent with that id is registered for the calling app.
    #[error("agent not found")]
    AgentNotFound,

    /// The session does not exist or has expired.
    #[error("session not found or expired")]
    SessionNotFound,

    /// The caller exceeded its hourly quota.
    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited {
        /// Seconds until the current window resets.
        retry_after: u64,
    },

    /// The backing key/value store failed.
    ///
    /// # Recovery
    ///
    /// Transient. Callers of fail-open operations never observe this variant.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A request field failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A low-level cryptographic primitive failed (bad key material, encoding).
    #[error("cryptographic operation failed: {0}")]
    CryptoError(String),

    /// Outbound HTTP failed.
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON (de)serialization of a stored or fetched document failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BotchaError {
    /// Stable snake_case code for this error, suitable for JSON responses.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ChallengeNotFound => "challenge_not_found",
            Self::ChallengeTooSlow { .. } => "challenge_too_slow",
            Self::WrongAnswer => "wrong_answer",
            Self::InvalidAnswerFormat(_) => "invalid_answer_format",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid(_) => "token_invalid",
            Self::TokenInvalidType => "token_invalid_type",
            Self::TokenInvalidAudience => "token_invalid_audience",
            Self::TokenIpMismatch => "token_ip_mismatch",
            Self::TokenRevoked => "token_revoked",
            Self::InvalidRefreshToken(_) => "invalid_refresh_token",
            Self::SignatureMissingHeaders => "signature_missing_headers",
            Self::InvalidSignatureInput(_) => "invalid_signature_input",
            Self::UntrustedProvider(_) => "untrusted_provider",
            Self::InvalidDirectoryUrl(_) => "invalid_directory_url",
            Self::DirectoryUnavailable(_) => "directory_unavailable",
            Self::SignatureKeyNotFound(_) => "signature_key_not_found",
            Self::SignatureInvalid => "signature_invalid",
            Self::SignatureExpired => "signature_expired",
            Self::SignatureReplayed => "signature_replayed",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::InsufficientCapability(_) => "insufficient_capability",
            Self::RestrictionViolated(_) => "restriction_violated",
            Self::AgentNotFound => "agent_not_found",
            Self::SessionNotFound => "session_not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::InvalidInput(_) => "invalid_input",
            Self::CryptoError(_) => "crypto_error",
            Self::HttpError(_) => "http_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Returns `true` when the failure came from a dependency rather than the caller.
    ///
    /// Fail-open operations swallow exactly these errors.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_)
                | Self::DirectoryUnavailable(_)
                | Self::HttpError(_)
                | Self::Serialization(_)
        )
    }

    /// Returns `true` when retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StorageUnavailable(_) | Self::DirectoryUnavailable(_) => true,
            Self::HttpError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }
}
