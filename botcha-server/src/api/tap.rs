//! Agent, session, and signature endpoints.

use axum::{
    Json,
    body::Bytes,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
};
use botcha::{
    BotchaError,
    tap::{RegisterAgent, SessionIntent, SignedRequest, TapSession, VerifiedSignature},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, SharedState, challenge::AppQuery};

#[derive(Debug, Deserialize)]
pub(super) struct RegisterBody {
    #[serde(default)]
    app_id: Option<String>,
    #[serde(flatten)]
    agent: RegisterAgent,
}

fn require_app_id(query: Option<String>, body: Option<String>) -> Result<String, ApiError> {
    query
        .or(body)
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| BotchaError::InvalidInput("app_id is required".into()).into())
}

pub(super) async fn register_agent(
    State(state): State<SharedState>,
    query: Result<Query<AppQuery>, QueryRejection>,
    body: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let Json(body) = body?;
    let app_id = require_app_id(query.app_id, body.app_id)?;

    let agent = state.sessions.registry().register(&app_id, body.agent).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    app_id: String,
    #[serde(default)]
    tap_only: bool,
}

pub(super) async fn list_agents(
    State(state): State<SharedState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let list = state.sessions.registry().list(&query.app_id, query.tap_only).await?;
    Ok(Json(list))
}

pub(super) async fn get_agent(
    State(state): State<SharedState>,
    Path(agent_id): Path<String>,
    query: Result<Query<AppQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let registry = state.sessions.registry();
    let agent = match query.app_id {
        Some(app_id) => registry.get_for_app(&agent_id, &app_id).await?,
        None => registry.get(&agent_id).await?,
    };
    Ok(Json(agent))
}

#[derive(Debug, Deserialize)]
struct SessionBody {
    agent_id: String,
    intent: SessionIntent,
    #[serde(default)]
    user_context: String,
    #[serde(default)]
    app_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionCreated {
    success: bool,
    #[serde(flatten)]
    session: TapSession,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<VerifiedSignature>,
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
        })
        .collect()
}

fn signed_request<'a>(
    method: &'a Method,
    uri: &'a Uri,
    headers: &'a [(String, String)],
    body: &'a [u8],
) -> SignedRequest<'a> {
    SignedRequest {
        method: method.as_str(),
        path: uri.path(),
        query: uri.query(),
        authority: uri.authority().map(axum::http::uri::Authority::as_str),
        headers,
        body,
    }
}

/// Opens a session. A request carrying `Signature` and `Signature-Input` is
/// verified against the agent's registered key first.
pub(super) async fn create_session(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let parsed: SessionBody =
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid session request: {e}")))?;

    let registry = state.sessions.registry();
    let app_id = match parsed.app_id {
        Some(app_id) => app_id,
        None => registry.get(&parsed.agent_id).await?.app_id,
    };

    let signed = headers.contains_key("signature") || headers.contains_key("signature-input");
    let (session, signature) = if signed {
        let pairs = header_pairs(&headers);
        let request = signed_request(&method, &uri, &pairs, &body);
        let (session, verified) = state
            .sessions
            .create_verified_session(
                &request,
                &parsed.agent_id,
                &app_id,
                &parsed.user_context,
                parsed.intent,
            )
            .await?;
        (session, Some(verified))
    } else {
        let session = state
            .sessions
            .create_session(&parsed.agent_id, &app_id, &parsed.user_context, parsed.intent)
            .await?;
        (session, None)
    };

    Ok((StatusCode::CREATED, Json(SessionCreated { success: true, session, signature })))
}

pub(super) async fn get_session(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.sessions.get_session(&session_id).await?;
    Ok(Json(view))
}

#[derive(Debug, Serialize)]
struct SignatureVerified {
    success: bool,
    verified: bool,
    #[serde(flatten)]
    signature: VerifiedSignature,
}

/// Verifies the request's own signature against the key directory named in
/// `Signature-Agent`.
pub(super) async fn verify_signature(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let pairs = header_pairs(&headers);
    let request = signed_request(&method, &uri, &pairs, &body);
    let signature = state.verifier.verify_with_directory(&request, &state.directory).await?;

    info!(key_id = %signature.key_id, "directory signature verified");
    Ok(Json(SignatureVerified { success: true, verified: true, signature }))
}
