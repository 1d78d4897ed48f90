//! Signed bearer tokens proving a solved challenge.
//!
//! Access tokens (`type = "botcha-verified"`) live five minutes; refresh tokens
//! (`type = "botcha-refresh"`) live an hour and can only mint new access tokens.
//! Both are HS256 JWTs whose subject is the solved challenge id.
//!
//! Revocation is optional and keyed by `jti`. An explicit revocation always
//! fails closed; a broken revocation backend fails open.

mod exchange;
pub mod jwt;
mod service;

pub use exchange::{ExchangeOptions, exchange_solution};
pub use jwt::{TokenClaims, TokenType};
pub use service::{
    ACCESS_TOKEN_TTL, IssuedToken, REFRESH_TOKEN_TTL, RevocationList, StoreRevocationList,
    TokenConfig, TokenPair, TokenRequest, TokenService, VerifyOptions, extract_bearer_token,
};
