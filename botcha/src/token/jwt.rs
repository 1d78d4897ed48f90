//! Compact HS256 JSON Web Tokens.
//!
//! Encoding and signature checks go through [`jsonwebtoken`]. Only `HS256` is
//! produced or accepted, and `exp`, `iat` and `sub` must be present. Expiry,
//! type, audience and IP binding are checked by
//! [`TokenService`](super::TokenService), which maps each to its own error.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{BotchaError, Result};

/// Kind of bearer token, carried in the `type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    /// Short-lived access token proving a solved challenge.
    #[serde(rename = "botcha-verified")]
    Verified,
    /// Longer-lived token that can mint new access tokens.
    #[serde(rename = "botcha-refresh")]
    Refresh,
}

/// Claims carried by every BOTCHA token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Id of the solved challenge.
    pub sub: String,
    /// Issued at, Unix seconds.
    pub iat: u64,
    /// Expires at, Unix seconds.
    pub exp: u64,
    /// Token id, the revocation handle.
    pub jti: String,
    /// Access or refresh.
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// How long the challenge took, in milliseconds.
    #[serde(rename = "solveTime", default)]
    pub solve_time_ms: u64,
    /// Intended audience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Client IP the token is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Application the challenge was solved for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

/// Signs `claims` with `secret`.
///
/// # Errors
///
/// Returns [`BotchaError::CryptoError`] if the claims cannot be encoded.
pub fn encode(claims: &TokenClaims, secret: &[u8]) -> Result<String> {
    let key = EncodingKey::from_secret(secret);
    jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &key)
        .map_err(|e| BotchaError::CryptoError(format!("JWT encoding failed: {e}")))
}

fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "iat", "sub"]);
    // checked by the token service without leeway
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation
}

/// Checks structure, algorithm and MAC, then returns the claims.
///
/// Tokens past `exp` still decode, so they can be revoked.
///
/// # Errors
///
/// Returns [`BotchaError::TokenInvalid`] for anything malformed or forged.
pub fn decode(token: &str, secret: &[u8]) -> Result<TokenClaims> {
    let key = DecodingKey::from_secret(secret);
    jsonwebtoken::decode::<TokenClaims>(token, &key, &validation())
        .map(|data| data.claims)
        .map_err(|e| BotchaError::TokenInvalid(e.to_string()))
}
