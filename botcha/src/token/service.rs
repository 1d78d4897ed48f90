//! Access/refresh token issuance, verification and revocation.

use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::jwt::{self, TokenClaims, TokenType};
use crate::{
    clock::now_secs,
    error::{BotchaError, Result},
    reliability::fail_open,
    security::audit::{AuditEvent, AuditEventType, audit_log},
    store::KvStore,
};

/// Default access token lifetime.
pub const ACCESS_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Default refresh token lifetime.
pub const REFRESH_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Token lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenConfig {
    /// Access token lifetime (default: 5 minutes).
    pub access_ttl: Duration,
    /// Refresh token lifetime (default: 1 hour).
    pub refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { access_ttl: ACCESS_TOKEN_TTL, refresh_ttl: REFRESH_TOKEN_TTL }
    }
}

/// What a token is about: the solved challenge and its context.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    /// Id of the solved challenge.
    pub subject: String,
    /// Solve time in milliseconds.
    pub solve_time_ms: u64,
    /// Audience to bind, if any.
    pub audience: Option<String>,
    /// Client IP to bind, if any.
    pub client_ip: Option<String>,
    /// Application id, if any.
    pub app_id: Option<String>,
}

/// A signed token and its lifetime.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWT.
    pub token: String,
    /// Seconds until expiry.
    pub expires_in: u64,
    /// The claims that were signed.
    pub claims: TokenClaims,
}

/// Result of a successful challenge exchange.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_expires_in: u64,
    /// Solve time carried in both tokens.
    pub solve_time_ms: u64,
}

/// Verification requirements beyond signature and expiry.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// When set, `aud` must equal this value.
    pub audience: Option<String>,
    /// When true, the token must be bound to `client_ip`.
    pub require_ip: bool,
    /// The caller's address.
    pub client_ip: Option<String>,
}

/// Source of truth for revoked token ids.
pub trait RevocationList: Send + Sync {
    /// Returns `true` if `jti` has been revoked.
    ///
    /// # Errors
    ///
    /// Infrastructure errors here make verification fail open.
    fn is_revoked(&self, jti: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Revokes `jti` for `ttl` (no need to remember it past the token's expiry).
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the revocation cannot be recorded.
    fn revoke(&self, jti: &str, ttl: Duration) -> impl Future<Output = Result<()>> + Send;
}

/// [`RevocationList`] kept in a [`KvStore`] under `revoked:{jti}`.
#[derive(Debug)]
pub struct StoreRevocationList<S> {
    store: Arc<S>,
}

impl<S> Clone for StoreRevocationList<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: KvStore> StoreRevocationList<S> {
    /// Wraps `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

fn revocation_key(jti: &str) -> String {
    format!("revoked:{jti}")
}

impl<S: KvStore> RevocationList for StoreRevocationList<S> {
    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        Ok(self.store.get(&revocation_key(jti)).await?.is_some())
    }

    async fn revoke(&self, jti: &str, ttl: Duration) -> Result<()> {
        self.store.put(&revocation_key(jti), "1".to_owned(), Some(ttl)).await
    }
}

/// Mints and checks HS256 bearer tokens.
///
/// # Examples
///
/// ```
/// use botcha::token::{TokenRequest, TokenService, VerifyOptions};
///
/// # fn example() -> botcha::error::Result<()> {
/// let tokens = TokenService::new(b"0123456789abcdef0123456789abcdef".to_vec())?;
/// let issued = tokens.issue_access_token(&TokenRequest {
///     subject: "challenge-1".into(),
///     solve_time_ms: 1500,
///     ..TokenRequest::default()
/// })?;
///
/// let claims = tokens.verify(&issued.token, &VerifyOptions::default())?;
/// assert_eq!(claims.solve_time_ms, 1500);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TokenService {
    secret: Arc<[u8]>,
    config: TokenConfig,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("secret", &"[REDACTED]")
            .field("config", &self.config)
            .finish()
    }
}

impl TokenService {
    /// Creates a service with default lifetimes.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::InvalidInput`] if `secret` is empty.
    pub fn new(secret: Vec<u8>) -> Result<Self> {
        Self::with_config(secret, TokenConfig::default())
    }

    /// Creates a service with custom lifetimes.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::InvalidInput`] if `secret` is empty or a lifetime is zero.
    pub fn with_config(secret: Vec<u8>, config: TokenConfig) -> Result<Self> {
        if secret.is_empty() {
            return Err(BotchaError::InvalidInput("token secret must not be empty".into()));
        }
        if config.access_ttl.is_zero() || config.refresh_ttl.is_zero() {
            return Err(BotchaError::InvalidInput("token lifetimes must be positive".into()));
        }
        Ok(Self { secret: secret.into(), config })
    }

    /// Lifetimes in effect.
    #[must_use]
    pub fn config(&self) -> TokenConfig {
        self.config
    }

    /// Issues a `botcha-verified` token.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::CryptoError`] if signing fails.
    pub fn issue_access_token(&self, request: &TokenRequest) -> Result<IssuedToken> {
        self.issue(request, TokenType::Verified, self.config.access_ttl)
    }

    /// Issues a `botcha-refresh` token.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::CryptoError`] if signing fails.
    pub fn issue_refresh_token(&self, request: &TokenRequest) -> Result<IssuedToken> {
        self.issue(request, TokenType::Refresh, self.config.refresh_ttl)
    }

    /// Issues an access and refresh token for the same request.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::CryptoError`] if signing fails.
    pub fn issue_pair(&self, request: &TokenRequest) -> Result<TokenPair> {
        let access = self.issue_access_token(request)?;
        let refresh = self.issue_refresh_token(request)?;

        audit_log(
            &AuditEvent::new(AuditEventType::TokenIssued, &request.subject, Uuid::new_v4())
                .with_token_id(&access.claims.jti),
        );

        Ok(TokenPair {
            access_token: access.token,
            refresh_token: refresh.token,
            expires_in: access.expires_in,
            refresh_expires_in: refresh.expires_in,
            solve_time_ms: request.solve_time_ms,
        })
    }

    fn issue(
        &self,
        request: &TokenRequest,
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<IssuedToken> {
        let iat = now_secs();
        let claims = TokenClaims {
            sub: request.subject.clone(),
            iat,
            exp: iat + ttl.as_secs(),
            jti: Uuid::new_v4().to_string(),
            token_type,
            solve_time_ms: request.solve_time_ms,
            aud: request.audience.clone(),
            client_ip: request.client_ip.clone(),
            app_id: request.app_id.clone(),
        };
        let token = self.sign(&claims)?;
        debug!(jti = %claims.jti, ?token_type, "token issued");
        Ok(IssuedToken { token, expires_in: ttl.as_secs(), claims })
    }

    pub(crate) fn sign(&self, claims: &TokenClaims) -> Result<String> {
        jwt::encode(claims, &self.secret)
    }

    /// Exchanges a refresh token for a new access token with the same subject,
    /// solve time, audience, IP binding and app.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::InvalidRefreshToken`] if the token is forged,
    /// expired, or not a refresh token.
    #[instrument(skip_all)]
    pub fn refresh(&self, refresh_token: &str) -> Result<IssuedToken> {
        let claims = self
            .check(refresh_token, TokenType::Refresh, &VerifyOptions::default())
            .map_err(|e| BotchaError::InvalidRefreshToken(e.to_string()))?;

        let issued = self.issue_access_token(&TokenRequest {
            subject: claims.sub,
            solve_time_ms: claims.solve_time_ms,
            audience: claims.aud,
            client_ip: claims.client_ip,
            app_id: claims.app_id,
        })?;

        audit_log(
            &AuditEvent::new(AuditEventType::TokenRefreshed, &issued.claims.sub, Uuid::new_v4())
                .with_token_id(&issued.claims.jti),
        );
        Ok(issued)
    }

    /// Like [`refresh`](Self::refresh), but rejects a revoked refresh token.
    ///
    /// # Errors
    ///
    /// Same as [`refresh`](Self::refresh); a revoked token is reported as
    /// [`BotchaError::InvalidRefreshToken`].
    pub async fn refresh_with_revocation<R: RevocationList>(
        &self,
        refresh_token: &str,
        revocations: &R,
    ) -> Result<IssuedToken> {
        let claims = self
            .check(refresh_token, TokenType::Refresh, &VerifyOptions::default())
            .map_err(|e| BotchaError::InvalidRefreshToken(e.to_string()))?;
        if is_revoked(revocations, &claims.jti).await? {
            return Err(BotchaError::InvalidRefreshToken("token revoked".into()));
        }
        self.refresh(refresh_token)
    }

    /// Verifies an access token.
    ///
    /// Fails closed on a bad signature, expiry, wrong type, audience mismatch
    /// (only when `options.audience` is set) and IP mismatch (only when
    /// `options.require_ip` is set).
    ///
    /// # Errors
    ///
    /// Returns the matching `Token*` variant of [`BotchaError`].
    pub fn verify(&self, token: &str, options: &VerifyOptions) -> Result<TokenClaims> {
        self.check(token, TokenType::Verified, options).inspect_err(|e| {
            warn!(reason = e.kind(), "token rejected");
            audit_log(
                &AuditEvent::new(AuditEventType::TokenRejected, "anonymous", Uuid::new_v4())
                    .with_error(e.to_string()),
            );
        })
    }

    /// [`verify`](Self::verify) plus a revocation lookup.
    ///
    /// A revoked `jti` fails closed with [`BotchaError::TokenRevoked`]. If the
    /// lookup itself fails, verification proceeds as if not revoked.
    ///
    /// # Errors
    ///
    /// Same as [`verify`](Self::verify), plus [`BotchaError::TokenRevoked`].
    pub async fn verify_with_revocation<R: RevocationList>(
        &self,
        token: &str,
        options: &VerifyOptions,
        revocations: &R,
    ) -> Result<TokenClaims> {
        let claims = self.verify(token, options)?;
        if is_revoked(revocations, &claims.jti).await? {
            warn!(jti = %claims.jti, "revoked token presented");
            audit_log(
                &AuditEvent::new(AuditEventType::TokenRejected, &claims.sub, Uuid::new_v4())
                    .with_token_id(&claims.jti)
                    .with_error(BotchaError::TokenRevoked.to_string()),
            );
            return Err(BotchaError::TokenRevoked);
        }
        Ok(claims)
    }

    /// Revokes any validly signed token (access or refresh) until it would have expired.
    ///
    /// Returns the revoked `jti`. Tokens already past `exp` need no entry.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::TokenInvalid`] for forged tokens and the
    /// revocation list's error if it cannot record the entry.
    #[instrument(skip_all)]
    pub async fn revoke<R: RevocationList>(&self, token: &str, revocations: &R) -> Result<String> {
        let claims = jwt::decode(token, &self.secret)?;
        let remaining = claims.exp.saturating_sub(now_secs());
        if remaining > 0 {
            revocations.revoke(&claims.jti, Duration::from_secs(remaining)).await?;
        }

        audit_log(
            &AuditEvent::new(AuditEventType::TokenRevoked, &claims.sub, Uuid::new_v4())
                .with_token_id(&claims.jti),
        );
        Ok(claims.jti)
    }

    fn check(
        &self,
        token: &str,
        expected: TokenType,
        options: &VerifyOptions,
    ) -> Result<TokenClaims> {
        let claims = jwt::decode(token, &self.secret)?;

        if now_secs() >= claims.exp {
            return Err(BotchaError::TokenExpired);
        }
        if claims.token_type != expected {
            return Err(BotchaError::TokenInvalidType);
        }
        if let Some(audience) = &options.audience {
            if claims.aud.as_ref() != Some(audience) {
                return Err(BotchaError::TokenInvalidAudience);
            }
        }
        if options.require_ip
            && (claims.client_ip.is_none() || claims.client_ip != options.client_ip)
        {
            return Err(BotchaError::TokenIpMismatch);
        }
        Ok(claims)
    }
}

async fn is_revoked<R: RevocationList>(revocations: &R, jti: &str) -> Result<bool> {
    fail_open("token.revocation_check", revocations.is_revoked(jti), false).await
}

/// Strips the `Bearer ` scheme from an `Authorization` header value.
///
/// # Examples
///
/// ```
/// use botcha::token::extract_bearer_token;
///
/// assert_eq!(extract_bearer_token(Some("Bearer abc.def.ghi")), Some("abc.def.ghi"));
/// assert_eq!(extract_bearer_token(Some("Basic dXNlcg==")), None);
/// assert_eq!(extract_bearer_token(None), None);
/// ```
#[must_use]
pub fn extract_bearer_token(header: Option<&str>) -> Option<&str> {
    header?.strip_prefix("Bearer ").map(str::trim).filter(|t| !t.is_empty())
}
