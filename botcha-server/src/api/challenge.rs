//! Speed and standard challenge endpoints.

use axum::{
    Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderName, HeaderValue},
    response::IntoResponse,
};
use botcha::{
    BotchaError,
    challenge::{Difficulty, SpeedChallenge, StandardChallenge},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ClientIp, SharedState, rate_limit_headers};

pub(super) type Headers = [(HeaderName, HeaderValue); 3];

/// Counts a challenge request against the caller's quota.
pub(super) async fn charge_rate_limit(
    state: &SharedState,
    ip: &ClientIp,
    app_id: Option<&str>,
) -> Result<Headers, ApiError> {
    let decision = state.rate_limiter.check(ip.as_str(), app_id).await;
    if !decision.allowed {
        let retry_after = decision.retry_after.unwrap_or(1);
        return Err(BotchaError::RateLimited { retry_after }.into());
    }
    Ok(rate_limit_headers(state.rate_limiter.limit(), &decision))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct AppQuery {
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SpeedChallengeView {
    pub id: String,
    pub problems: Vec<u64>,
    pub time_limit: u64,
    pub instructions: String,
}

impl From<SpeedChallenge> for SpeedChallengeView {
    fn from(c: SpeedChallenge) -> Self {
        Self {
            id: c.id,
            problems: c.problems,
            time_limit: c.time_limit_ms,
            instructions: c.instructions,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StandardChallengeView {
    id: String,
    puzzle: String,
    time_limit: u64,
    hint: String,
    difficulty: Difficulty,
}

impl From<StandardChallenge> for StandardChallengeView {
    fn from(c: StandardChallenge) -> Self {
        Self {
            id: c.id,
            puzzle: c.puzzle,
            time_limit: c.time_limit_ms,
            hint: c.hint,
            difficulty: c.difficulty,
        }
    }
}

#[derive(Debug, Serialize)]
struct Issued<T> {
    success: bool,
    challenge: T,
}

pub(super) async fn issue_speed(
    State(state): State<SharedState>,
    ip: ClientIp,
    query: Result<Query<AppQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let headers = charge_rate_limit(&state, &ip, query.app_id.as_deref()).await?;
    let challenge = state.engine.issue_speed().await?;

    Ok((headers, Json(Issued { success: true, challenge: SpeedChallengeView::from(challenge) })))
}

#[derive(Debug, Deserialize)]
pub(super) struct SpeedAnswers {
    id: String,
    answers: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeedVerdict {
    success: bool,
    solve_time_ms: u64,
    message: String,
    verdict: &'static str,
}

pub(super) async fn verify_speed(
    State(state): State<SharedState>,
    body: Result<Json<SpeedAnswers>, JsonRejection>,
) -> Result<Json<impl Serialize>, ApiError> {
    let Json(body) = body?;
    let solved = state.engine.verify_speed(&body.id, &body.answers).await?;

    Ok(Json(SpeedVerdict {
        success: true,
        solve_time_ms: solved.solve_time_ms,
        message: format!("Solved in {}ms", solved.solve_time_ms),
        verdict: "verified_agent",
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct StandardQuery {
    difficulty: Option<String>,
    app_id: Option<String>,
}

pub(super) async fn issue_standard(
    State(state): State<SharedState>,
    ip: ClientIp,
    query: Result<Query<StandardQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let difficulty = match query.difficulty.as_deref() {
        Some(raw) => raw.parse()?,
        None => state.default_difficulty,
    };
    let headers = charge_rate_limit(&state, &ip, query.app_id.as_deref()).await?;
    let challenge = state.engine.issue_standard(difficulty).await?;

    Ok((headers, Json(Issued { success: true, challenge: StandardChallengeView::from(challenge) })))
}

#[derive(Debug, Deserialize)]
pub(super) struct StandardAnswer {
    id: String,
    answer: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StandardVerdict {
    success: bool,
    solve_time: u64,
}

pub(super) async fn verify_standard(
    State(state): State<SharedState>,
    body: Result<Json<StandardAnswer>, JsonRejection>,
) -> Result<Json<impl Serialize>, ApiError> {
    let Json(body) = body?;
    let solved = state.engine.verify_standard(&body.id, &body.answer).await?;
    Ok(Json(StandardVerdict { success: true, solve_time: solved.solve_time_ms }))
}
