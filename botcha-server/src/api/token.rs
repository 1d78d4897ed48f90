//! Token endpoints and the bearer-token extractor.

use axum::{
    Json,
    extract::{
        FromRequestParts, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use botcha::{
    BotchaError,
    token::{
        ExchangeOptions, TokenClaims, TokenRequest, VerifyOptions, exchange_solution,
        extract_bearer_token,
    },
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ApiError, ClientIp, SharedState,
    challenge::{AppQuery, SpeedChallengeView, charge_rate_limit},
};

/// Header carrying the id of an inline-solved challenge.
pub const CHALLENGE_ID_HEADER: &str = "x-botcha-challenge-id";

/// Header carrying the inline answers as a JSON array of strings.
pub const ANSWERS_HEADER: &str = "x-botcha-answers";

/// Header carrying the inline answer to a standard challenge.
pub const SOLUTION_HEADER: &str = "x-botcha-solution";

/// Header carrying the caller's app id on inline solutions.
pub const APP_ID_HEADER: &str = "x-botcha-app-id";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenChallenge {
    success: bool,
    #[serde(flatten)]
    flat: SpeedChallengeView,
    challenge: SpeedChallengeView,
    next_step: &'static str,
}

pub(super) async fn issue_token_challenge(
    State(state): State<SharedState>,
    ip: ClientIp,
    query: Result<Query<AppQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let headers = charge_rate_limit(&state, &ip, query.app_id.as_deref()).await?;
    let challenge = SpeedChallengeView::from(state.engine.issue_speed().await?);

    Ok((
        headers,
        Json(TokenChallenge {
            success: true,
            flat: challenge.clone(),
            challenge,
            next_step: "POST /v1/token/verify with {id, answers}",
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenSolution {
    id: String,
    answers: Vec<String>,
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    audience: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenGranted {
    success: bool,
    verified: bool,
    token: String,
    access_token: String,
    refresh_token: String,
    expires_in: u64,
    refresh_expires_in: u64,
    #[serde(rename = "solveTimeMs")]
    solve_time_ms: u64,
}

pub(super) async fn verify_solution(
    State(state): State<SharedState>,
    ip: ClientIp,
    body: Result<Json<TokenSolution>, JsonRejection>,
) -> Result<Json<impl Serialize>, ApiError> {
    let Json(body) = body?;
    let options = ExchangeOptions { audience: body.audience, client_ip: ip.0, app_id: body.app_id };
    let pair =
        exchange_solution(&state.engine, &state.tokens, &body.id, &body.answers, options).await?;

    Ok(Json(TokenGranted {
        success: true,
        verified: true,
        token: pair.access_token.clone(),
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
        expires_in: pair.expires_in,
        refresh_expires_in: pair.refresh_expires_in,
        solve_time_ms: pair.solve_time_ms,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct RefreshBody {
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct Refreshed {
    success: bool,
    access_token: String,
    expires_in: u64,
}

pub(super) async fn refresh(
    State(state): State<SharedState>,
    body: Result<Json<RefreshBody>, JsonRejection>,
) -> Result<Json<impl Serialize>, ApiError> {
    let Json(body) = body?;
    let issued =
        state.tokens.refresh_with_revocation(&body.refresh_token, &state.revocations).await?;
    Ok(Json(Refreshed { success: true, access_token: issued.token, expires_in: issued.expires_in }))
}

#[derive(Debug, Deserialize)]
pub(super) struct RevokeBody {
    token: String,
}

#[derive(Debug, Serialize)]
struct Revoked {
    success: bool,
    revoked: String,
}

pub(super) async fn revoke(
    State(state): State<SharedState>,
    body: Result<Json<RevokeBody>, JsonRejection>,
) -> Result<Json<impl Serialize>, ApiError> {
    let Json(body) = body?;
    let jti = state.tokens.revoke(&body.token, &state.revocations).await?;
    Ok(Json(Revoked { success: true, revoked: jti }))
}

#[derive(Debug, Serialize)]
struct ProtectedBody {
    success: bool,
    message: &'static str,
    challenge_id: String,
    solve_time_ms: u64,
    app_id: Option<String>,
}

pub(super) async fn protected(VerifiedToken(claims): VerifiedToken) -> Json<impl Serialize> {
    Json(ProtectedBody {
        success: true,
        message: "verified agent",
        challenge_id: claims.sub,
        solve_time_ms: claims.solve_time_ms,
        app_id: claims.app_id,
    })
}

/// Claims of a verified caller.
///
/// Accepts, in order:
///
/// 1. `Authorization: Bearer <access token>`, checked for expiry, type and
///    revocation
/// 2. an inline solution in `X-Botcha-Challenge-Id` + `X-Botcha-Answers`
///    (speed) or `X-Botcha-Solution` (standard), exchanged on the spot for an
///    access token
///
/// Otherwise rejects with 403 and a fresh speed challenge in the body, which
/// clients solve and retry with the inline headers. Issuing that challenge is
/// charged to the caller's rate limit, so an exhausted caller gets 429.
#[derive(Debug, Clone)]
pub struct VerifiedToken(pub TokenClaims);

#[derive(Debug, Serialize)]
struct ChallengeRequired {
    success: bool,
    error: &'static str,
    message: &'static str,
    challenge: SpeedChallengeView,
}

impl FromRequestParts<SharedState> for VerifiedToken {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let header = |name: &str| parts.headers.get(name).and_then(|v| v.to_str().ok());

        if let Some(token) = extract_bearer_token(header("authorization")) {
            return state
                .tokens
                .verify_with_revocation(token, &VerifyOptions::default(), &state.revocations)
                .await
                .map(Self)
                .map_err(|e| ApiError::from(e).into_response());
        }

        if let Some(id) = header(CHALLENGE_ID_HEADER) {
            let solution = match (header(ANSWERS_HEADER), header(SOLUTION_HEADER)) {
                (Some(raw), _) => Some(InlineSolution::Speed(raw)),
                (None, Some(answer)) => Some(InlineSolution::Standard(answer)),
                (None, None) => None,
            };
            if let Some(solution) = solution {
                debug!("inline challenge solution presented");
                return inline_solution(state, id, solution, header(APP_ID_HEADER))
                    .await
                    .map(Self)
                    .map_err(|e| ApiError::from(e).into_response());
            }
        }

        // charged like GET /api/speed-challenge
        let Ok(ip) = ClientIp::from_request_parts(parts, state).await;
        let app_id = parts.headers.get(APP_ID_HEADER).and_then(|v| v.to_str().ok());
        let rate_headers = match charge_rate_limit(state, &ip, app_id).await {
            Ok(headers) => headers,
            Err(e) => return Err(e.into_response()),
        };

        let challenge = match state.engine.issue_speed().await {
            Ok(challenge) => SpeedChallengeView::from(challenge),
            Err(e) => return Err(ApiError::from(e).into_response()),
        };
        Err((
            StatusCode::FORBIDDEN,
            rate_headers,
            Json(ChallengeRequired {
                success: false,
                error: "challenge_required",
                message: concat!(
                    "solve the challenge and retry with ",
                    "X-Botcha-Challenge-Id and X-Botcha-Answers",
                ),
                challenge,
            }),
        )
            .into_response())
    }
}

enum InlineSolution<'a> {
    /// JSON array from `X-Botcha-Answers`.
    Speed(&'a str),
    /// Digest from `X-Botcha-Solution`.
    Standard(&'a str),
}

async fn inline_solution(
    state: &SharedState,
    challenge_id: &str,
    solution: InlineSolution<'_>,
    app_id: Option<&str>,
) -> botcha::Result<TokenClaims> {
    let solved = match solution {
        InlineSolution::Speed(raw) => {
            let answers: Vec<String> = serde_json::from_str(raw)
                .map_err(|e| BotchaError::InvalidAnswerFormat(format!("{ANSWERS_HEADER}: {e}")))?;
            state.engine.verify_speed(challenge_id, &answers).await?
        }
        InlineSolution::Standard(answer) => {
            state.engine.verify_standard(challenge_id, answer).await?
        }
    };

    let issued = state.tokens.issue_access_token(&TokenRequest {
        subject: challenge_id.to_owned(),
        solve_time_ms: solved.solve_time_ms,
        app_id: app_id.map(str::to_owned),
        ..TokenRequest::default()
    })?;
    Ok(issued.claims)
}
