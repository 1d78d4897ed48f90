//! BOTCHA: Reverse CAPTCHA for AI Agents
//!
//! A CAPTCHA keeps bots out. BOTCHA keeps humans out: it proves an HTTP caller
//! is an automated agent by asking it to do, within a few hundred
//! milliseconds, what only code can do. An agent that passes receives a
//! short-lived signed token, and may go on to register a cryptographic
//! identity and open capability-scoped sessions under the Trusted Agent
//! Protocol (TAP).
//!
//! # What is in this crate?
//!
//! - **Challenges**: speed (SHA-256 of five numbers in 500ms) and standard
//!   (prime generation plus hashing, difficulty-tiered)
//! - **Tokens**: HS256 access/refresh tokens with audience and client-IP binding
//!   and `jti` revocation
//! - **Rate limiting**: fixed one-hour windows per IP or per app
//! - **HTTP message signatures**: RFC 9421 verification with ECDSA P-256 and
//!   RSA-PSS keys, key directories, nonce replay protection
//! - **Agents and sessions**: registered keys and capabilities, intents checked
//!   against a capability snapshot
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   AI Agent      │
//! └────────┬────────┘
//!          │ HTTPS (challenge answers, Bearer tokens, Signature headers)
//! ┌────────▼────────────────────────────────────────────┐
//! │                   botcha (this crate)               │
//! │  ┌────────────┐  ┌──────────┐  ┌─────────────────┐  │
//! │  │ Challenge  │──│  Token   │  │  TAP verifier,  │  │
//! │  │  Engine    │  │ Service  │  │ registry, sessions│ │
//! │  └────────────┘  └──────────┘  └─────────────────┘  │
//! │        │      rate limiter, fail-open, audit │       │
//! └────────┼─────────────────────────────────────┼──────┘
//!          │ KvStore (get / put-with-ttl / delete)│
//! ┌────────▼─────────────────────────────────────▼──────┐
//! │   Key/value store (MemoryStore or your backend)     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use botcha::{
//!     challenge::{ChallengeEngine, solve_speed},
//!     store::MemoryStore,
//!     token::{ExchangeOptions, TokenService, VerifyOptions, exchange_solution},
//! };
//!
//! # async fn example() -> botcha::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let engine = ChallengeEngine::new(Arc::clone(&store));
//! let tokens = TokenService::new(b"a-long-random-secret".to_vec())?;
//!
//! // The agent fetches a challenge and answers it
//! let challenge = engine.issue_speed().await?;
//! let answers = solve_speed(&challenge.problems);
//!
//! // The server exchanges the answers for tokens
//! let options = ExchangeOptions::default();
//! let pair = exchange_solution(&engine, &tokens, &challenge.id, &answers, options).await?;
//!
//! // Downstream routes check the access token
//! let claims = tokens.verify(&pair.access_token, &VerifyOptions::default())?;
//! assert_eq!(claims.sub, challenge.id);
//! # Ok(())
//! # }
//! ```
//!
//! # Failure Policy
//!
//! Security decisions fail closed: wrong answers, bad signatures, revoked
//! tokens and missing capabilities are always rejected. Infrastructure faults
//! in non-critical paths fail open through [`reliability::fail_open`]: a
//! storage outage never blocks a legitimate agent because of rate limiting,
//! revocation lookups or nonce bookkeeping.
//!
//! ```rust
//! use botcha::BotchaError;
//!
//! fn status(err: &BotchaError) -> u16 {
//!     match err {
//!         BotchaError::RateLimited { .. } => 429,
//!         e if e.is_infrastructure() => 500,
//!         _ => 403,
//!     }
//! }
//! # assert_eq!(status(&BotchaError::WrongAnswer), 403);
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and rsa"
)]

pub mod challenge;
pub mod clock;
pub mod error;
pub mod reliability;
pub mod security;
pub mod store;
pub mod tap;
pub mod token;

pub use error::{BotchaError, Result};
