//! HTTP surface.
//!
//! | Route | Handler |
//! |---|---|
//! | `GET /health` | store round trip and configuration checks |
//! | `GET/POST /api/speed-challenge` | speed challenge issue / verify |
//! | `GET/POST /api/challenge` | standard challenge issue / verify |
//! | `GET /v1/token` | challenge for the token flow |
//! | `POST /v1/token/verify` | answers for access + refresh tokens |
//! | `POST /v1/token/refresh` | refresh for access token |
//! | `POST /v1/token/revoke` | revoke a token |
//! | `GET /v1/protected` | demo route behind [`VerifiedToken`] |
//! | `POST /v1/agents/register/tap` | register an agent |
//! | `GET /v1/agents/tap` | list an app's agents |
//! | `GET /v1/agents/{id}/tap` | fetch an agent |
//! | `POST /v1/sessions/tap` | open a session (signature-verified when signed) |
//! | `GET /v1/sessions/{id}/tap` | fetch a session |
//! | `POST /v1/signatures/verify` | verify a request against its key directory |

mod challenge;
mod error;
mod tap;
mod token;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, request::Parts},
    response::IntoResponse,
    routing::{get, post},
};
use botcha::{
    challenge::{ChallengeEngine, Difficulty},
    security::{RateLimitDecision, RateLimiter},
    store::{KvStore, MemoryStore},
    tap::{DirectoryResolver, SessionManager, TapVerifier},
    token::{StoreRevocationList, TokenService},
};
use tracing::debug;

pub use self::{
    error::{ApiError, ErrorBody, status_for},
    token::VerifiedToken,
};
use crate::{
    config::ServerConfig,
    error::Result,
    observability::{HealthCheck, HealthReport, HealthStatus},
};

/// Store backing every service.
pub type Store = MemoryStore;

/// Services shared by all handlers.
#[derive(Debug)]
pub struct AppState {
    /// Backing store.
    pub store: Arc<Store>,
    /// Challenge issuance and verification.
    pub engine: ChallengeEngine<Store>,
    /// Token signing and verification.
    pub tokens: TokenService,
    /// Revoked token ids.
    pub revocations: StoreRevocationList<Store>,
    /// Per-IP / per-app quota for challenge issuance.
    pub rate_limiter: RateLimiter<Store>,
    /// Agents and sessions.
    pub sessions: SessionManager<Store>,
    /// HTTP message signature verification.
    pub verifier: TapVerifier<Store>,
    /// Key directory lookup.
    pub directory: DirectoryResolver<Store>,
    /// Difficulty when none is requested.
    pub default_difficulty: Difficulty,
    rate_limit_enabled: bool,
    allow_list_enforced: bool,
    trusted_proxies: Vec<IpAddr>,
    started_at: Instant,
}

/// Shared handle passed to handlers.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Wires every service to `store` using `config`.
    ///
    /// # Errors
    ///
    /// Fails if the token secret is unusable or the HTTP client cannot be built.
    pub fn new(config: &ServerConfig, store: Arc<Store>) -> Result<Self> {
        let tokens =
            TokenService::with_config(
                config.tokens.jwt_secret.as_bytes().to_vec(),
                config.token_config(),
            )?;
        let rate_limiter = if config.rate_limit.enabled {
            RateLimiter::new(Arc::clone(&store), config.rate_limit_config())
        } else {
            RateLimiter::without_store(config.rate_limit_config())
        };

        Ok(Self {
            engine: ChallengeEngine::new(Arc::clone(&store)),
            tokens,
            revocations: StoreRevocationList::new(Arc::clone(&store)),
            rate_limiter,
            sessions: SessionManager::new(Arc::clone(&store)),
            verifier: TapVerifier::new(Arc::clone(&store)),
            directory: DirectoryResolver::new(Arc::clone(&store), config.directory_config())?,
            default_difficulty: config.challenges.default_difficulty,
            rate_limit_enabled: config.rate_limit.enabled,
            allow_list_enforced: config.signatures.enforce_allow_list,
            trusted_proxies: config.trusted_proxies.clone(),
            started_at: Instant::now(),
            store,
        })
    }
}

/// Builds the router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/speed-challenge", get(challenge::issue_speed).post(challenge::verify_speed))
        .route("/api/challenge", get(challenge::issue_standard).post(challenge::verify_standard))
        .route("/v1/token", get(token::issue_token_challenge))
        .route("/v1/token/verify", post(token::verify_solution))
        .route("/v1/token/refresh", post(token::refresh))
        .route("/v1/token/revoke", post(token::revoke))
        .route("/v1/protected", get(token::protected))
        .route("/v1/agents/register/tap", post(tap::register_agent))
        .route("/v1/agents/tap", get(tap::list_agents))
        .route("/v1/agents/{id}/tap", get(tap::get_agent))
        .route("/v1/sessions/tap", post(tap::create_session))
        .route("/v1/sessions/{id}/tap", get(tap::get_session))
        .route("/v1/signatures/verify", post(tap::verify_signature))
        .with_state(state)
}

/// Caller address.
///
/// The socket peer, taken from [`ConnectInfo`]. When the peer is one of the
/// configured trusted proxies, the client is read from `X-Forwarded-For`
/// (rightmost hop that is not itself a trusted proxy), then `X-Real-IP`.
/// Forwarding headers from any other peer are ignored. `None` when the server
/// runs without connect info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub Option<String>);

impl ClientIp {
    /// The address, or `unknown`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or("unknown")
    }
}

impl FromRequestParts<SharedState> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = client_ip_from(&parts.headers, peer, &state.trusted_proxies);
        Ok(Self(ip.map(|ip| ip.to_string())))
    }
}

fn client_ip_from(headers: &HeaderMap, peer: Option<IpAddr>, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.contains(&peer) {
        return Some(peer);
    }

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    if let Some(forwarded) = header("x-forwarded-for") {
        let mut last = None;
        for hop in forwarded.rsplit(',') {
            let Ok(ip) = hop.trim().parse::<IpAddr>() else {
                break;
            };
            last = Some(ip);
            if !trusted.contains(&ip) {
                return Some(ip);
            }
        }
        return Some(last.unwrap_or(peer));
    }

    header("x-real-ip").and_then(|v| v.trim().parse().ok()).or(Some(peer))
}

/// `X-RateLimit-*` headers for a decision.
fn rate_limit_headers(
    limit: u32,
    decision: &RateLimitDecision,
) -> [(HeaderName, HeaderValue); 3] {
    [
        (HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(limit)),
        (HeaderName::from_static("x-ratelimit-remaining"), HeaderValue::from(decision.remaining)),
        (HeaderName::from_static("x-ratelimit-reset"), HeaderValue::from(decision.reset_at / 1000)),
    ]
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let mut checks = Vec::with_capacity(3);

    let round_trip = async {
        let ttl = Some(std::time::Duration::from_secs(10));
        state.store.put("health:store", "ok".to_owned(), ttl).await?;
        state.store.get("health:store").await
    };
    checks.push(match round_trip.await {
        Ok(Some(_)) => HealthCheck::pass("store"),
        Ok(None) => HealthCheck::warn("store", "written value not readable"),
        Err(e) => HealthCheck::fail("store", e.to_string()),
    });

    checks.push(if state.rate_limit_enabled {
        HealthCheck::pass_with_message(
            "rate_limit",
            format!("{} requests/hour", state.rate_limiter.limit()),
        )
    } else {
        HealthCheck::warn("rate_limit", "disabled")
    });

    checks.push(if state.allow_list_enforced {
        HealthCheck::pass_with_message(
            "directory_allow_list",
            format!("{} trusted hosts", state.directory.config().trusted_hosts.len()),
        )
    } else {
        HealthCheck::pass_with_message("directory_allow_list", "not enforced")
    });

    let report = HealthReport::new(state.started_at.elapsed().as_secs(), checks);
    debug!(status = ?report.status, "health check");
    let status = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}
