//! Trusted Agent Protocol: agent identity, HTTP message signatures, sessions.
//!
//! An agent that has proven it is automated can go further and register a
//! public key and a list of capabilities. Requests it signs per RFC 9421 are
//! then verified against that key (or against the key directory named in its
//! `Signature-Agent` header), and it can open sessions scoped to a declared
//! intent.
//!
//! # Components
//!
//! - [`signature_input`]: RFC 8941 parsing of `Signature-Input` and `Signature`
//! - [`TapVerifier`]: signature base reconstruction, ECDSA P-256 / RSA-PSS
//!   verification, freshness, `Content-Digest`, nonce replay protection
//! - [`DirectoryResolver`]: HTTPS key directory fetch with caching and host allow-list
//! - [`AgentRegistry`]: agent records and per-app listing
//! - [`SessionManager`]: capability checks and time-limited sessions
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use botcha::{
//!     store::MemoryStore,
//!     tap::{Capability, RegisterAgent, SessionIntent, SessionManager},
//! };
//!
//! # async fn example() -> botcha::error::Result<()> {
//! let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
//! let agent = sessions
//!     .registry()
//!     .register("app_demo", RegisterAgent {
//!         name: "shopper".into(),
//!         capabilities: vec![Capability::new("browse").with_scope(["products"])],
//!         ..RegisterAgent::default()
//!     })
//!     .await?;
//!
//! let session = sessions
//!     .create_session(&agent.agent_id, "app_demo", "user-1", SessionIntent::new("browse"))
//!     .await?;
//! assert_eq!(session.capabilities.len(), 1);
//! # Ok(())
//! # }
//! ```

mod agent;
mod capability;
mod directory;
mod session;
pub mod signature_input;
mod verifier;


pub use agent::{AgentList, AgentRegistry, RegisterAgent, TapAgent, TrustLevel};
pub use capability::{Capability, CapabilityRestrictions, SessionIntent, authorize};
pub use directory::{
    DIRECTORY_CACHE_TTL, DIRECTORY_FETCH_TIMEOUT, DirectoryConfig, DirectoryKey, DirectoryResolver,
    KeyDirectory,
};
pub use session::{
    DEFAULT_SESSION_SECS, MAX_SESSION_SECS, SessionManager, SessionView, TapSession,
    clamp_session_duration,
};
pub use signature_input::{SignatureInput, parse_signature, parse_signature_input};
pub use verifier::{
    CLOCK_SKEW, MAX_SIGNATURE_AGE, SignatureAlgorithm, SignedRequest, TapVerifier, VerificationKey,
    VerifiedSignature, build_signature_base, compute_content_digest, detect_algorithm,
    validate_public_key, verify_signature,
};
