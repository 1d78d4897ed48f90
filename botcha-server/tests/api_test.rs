//! In-process tests of the HTTP surface.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode, header},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use botcha::{
    challenge::solve_speed,
    clock::now_secs,
    store::MemoryStore,
    tap::{SignedRequest, build_signature_base, compute_content_digest},
};
use botcha_server::{AppState, ServerConfig, router};
use http_body_util::BodyExt;
use p256::{
    ecdsa::{Signature, SigningKey, signature::Signer},
    pkcs8::{EncodePublicKey, LineEnding},
};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &str = "api-test-secret-0123456789abcdef";

const DEFAULT_PEER: &str = "203.0.113.10";

fn app_with(toml: &str) -> Router {
    let mut config = ServerConfig::from_toml(toml).unwrap();
    config.apply_env_overrides(Some(SECRET.to_owned()));
    config.validate().unwrap();
    let state = AppState::new(&config, Arc::new(MemoryStore::new())).unwrap();
    router(Arc::new(state))
}

fn app() -> Router {
    app_with("")
}

/// Sends `request`, from [`DEFAULT_PEER`] unless a peer is already attached.
async fn send(app: &Router, mut request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    if request.extensions().get::<ConnectInfo<SocketAddr>>().is_none() {
        request = from_peer(request, DEFAULT_PEER);
    }
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn from_peer(mut request: Request<Body>, ip: &str) -> Request<Body> {
    let addr = SocketAddr::new(ip.parse().unwrap(), 40_000);
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn problems(challenge: &Value) -> Vec<u64> {
    challenge["problems"].as_array().unwrap().iter().map(|p| p.as_u64().unwrap()).collect()
}

async fn obtain_tokens(app: &Router) -> Value {
    let (status, _, issued) = send(app, get("/v1/token")).await;
    assert_eq!(status, StatusCode::OK);
    let answers = solve_speed(&problems(&issued));

    let body = json!({"id": issued["id"], "answers": answers});
    let (status, _, granted) = send(app, post_json("/v1/token/verify", &body)).await;
    assert_eq!(status, StatusCode::OK, "{granted}");
    granted
}

#[tokio::test]
async fn test_health() {
    let (status, _, body) = send(&app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    let names: Vec<&str> =
        body["checks"].as_array().unwrap().iter().map(|c| c["name"].as_str().unwrap()).collect();
    assert!(names.contains(&"store"));
}

#[tokio::test]
async fn test_speed_challenge_round_trip() {
    let app = app();
    let (status, headers, body) = send(&app, get("/api/speed-challenge")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-ratelimit-limit"], "100");
    assert_eq!(headers["x-ratelimit-remaining"], "99");

    let challenge = &body["challenge"];
    assert_eq!(challenge["timeLimit"], 500);
    let answers = solve_speed(&problems(challenge));

    let submission = json!({"id": challenge["id"], "answers": answers});
    let (status, _, verdict) = send(&app, post_json("/api/speed-challenge", &submission)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["success"], true);
    assert_eq!(verdict["verdict"], "verified_agent");

    // single use
    let (status, _, err) = send(&app, post_json("/api/speed-challenge", &submission)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "challenge_not_found");
}

#[tokio::test]
async fn test_wrong_answers_rejected() {
    let app = app();
    let (_, _, body) = send(&app, get("/api/speed-challenge")).await;
    let wrong = vec!["00000000"; 5];

    let submission = json!({"id": body["challenge"]["id"], "answers": wrong});
    let (status, _, err) = send(&app, post_json("/api/speed-challenge", &submission)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["success"], false);
    assert_eq!(err["error"], "wrong_answer");
}

#[tokio::test]
async fn test_standard_challenge_difficulty() {
    let app = app();
    let (status, _, body) = send(&app, get("/api/challenge?difficulty=hard")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["challenge"]["difficulty"], "hard");

    let (status, _, err) = send(&app, get("/api/challenge?difficulty=impossible")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_input");
}

#[tokio::test]
async fn test_token_flow() {
    let app = app();
    let granted = obtain_tokens(&app).await;
    assert_eq!(granted["verified"], true);
    assert_eq!(granted["token"], granted["access_token"]);
    let access = granted["access_token"].as_str().unwrap().to_owned();

    let protected = |token: &str| {
        Request::get("/v1/protected")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };
    let (status, _, body) = send(&app, protected(&access)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "verified agent");

    let refresh = json!({"refresh_token": granted["refresh_token"]});
    let (status, _, refreshed) = send(&app, post_json("/v1/token/refresh", &refresh)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(refreshed["access_token"].as_str().is_some_and(|t| !t.is_empty()));

    let (status, _, revoked) =
        send(&app, post_json("/v1/token/revoke", &json!({"token": access}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(revoked["revoked"].is_string());

    let (status, _, err) = send(&app, protected(&access)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "token_revoked");
}

#[tokio::test]
async fn test_refresh_token_is_not_an_access_token() {
    let app = app();
    let granted = obtain_tokens(&app).await;
    let refresh_token = granted["refresh_token"].as_str().unwrap();
    let request = Request::get("/v1/protected")
        .header(header::AUTHORIZATION, format!("Bearer {refresh_token}"))
        .body(Body::empty())
        .unwrap();

    let (status, _, err) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "token_invalid_type");
}

#[tokio::test]
async fn test_protected_route_inline_challenge() {
    let app = app();
    let (status, _, body) = send(&app, get("/v1/protected")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "challenge_required");

    let challenge = &body["challenge"];
    let answers = serde_json::to_string(&solve_speed(&problems(challenge))).unwrap();
    let request = Request::get("/v1/protected")
        .header("x-botcha-challenge-id", challenge["id"].as_str().unwrap())
        .header("x-botcha-answers", answers)
        .header("x-botcha-app-id", "app_inline")
        .body(Body::empty())
        .unwrap();

    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["app_id"], "app_inline");
    assert_eq!(body["challenge_id"], challenge["id"]);
}

#[tokio::test]
async fn test_rate_limit() {
    let app = app_with("[rate_limit]\nrequests_per_hour = 2\n");
    for remaining in ["1", "0"] {
        let (status, headers, _) = send(&app, get("/api/speed-challenge")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-ratelimit-remaining"], remaining);
    }

    let (status, headers, err) = send(&app, get("/api/speed-challenge")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err["error"], "rate_limited");
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=3600).contains(&retry_after));

    // other callers have their own window
    let other = from_peer(get("/api/speed-challenge"), "198.51.100.99");
    let (status, _, _) = send(&app, other).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_ignores_forwarded_headers_from_clients() {
    let app = app_with("[rate_limit]\nrequests_per_hour = 2\n");
    let mut statuses = Vec::new();
    for n in 1..=4 {
        let request = Request::get("/api/speed-challenge")
            .header("x-forwarded-for", format!("192.0.2.{n}"))
            .header("x-real-ip", format!("198.51.100.{n}"))
            .body(Body::empty())
            .unwrap();
        statuses.push(send(&app, request).await.0);
    }

    assert_eq!(
        statuses,
        [
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );
}

#[tokio::test]
async fn test_rate_limit_behind_trusted_proxy() {
    let app =
        app_with("trusted_proxies = [\"10.0.0.1\"]\n[rate_limit]\nrequests_per_hour = 1\n");
    let via_proxy = |client: &str| {
        let request = Request::get("/api/speed-challenge")
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap();
        from_peer(request, "10.0.0.1")
    };

    assert_eq!(send(&app, via_proxy("203.0.113.5")).await.0, StatusCode::OK);
    assert_eq!(send(&app, via_proxy("203.0.113.5")).await.0, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(send(&app, via_proxy("203.0.113.6")).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_token_binds_socket_peer() {
    let app = app();
    let (_, _, issued) = send(&app, get("/v1/token")).await;
    let answers = solve_speed(&problems(&issued));
    let request = Request::post("/v1/token/verify")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "192.0.2.77")
        .body(Body::from(json!({"id": issued["id"], "answers": answers}).to_string()))
        .unwrap();

    let (status, _, granted) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{granted}");
    let claims = decode_claims(granted["access_token"].as_str().unwrap());
    assert_eq!(claims["client_ip"], DEFAULT_PEER);
}

#[tokio::test]
async fn test_protected_route_challenge_is_rate_limited() {
    let app = app_with("[rate_limit]\nrequests_per_hour = 1\n");

    let (status, headers, body) = send(&app, get("/v1/protected")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "challenge_required");
    assert_eq!(headers["x-ratelimit-remaining"], "0");

    let (status, headers, err) = send(&app, get("/v1/protected")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(err["error"], "rate_limited");
    assert!(headers.contains_key(header::RETRY_AFTER));
    assert!(err.get("challenge").is_none());

    // the same budget covers the challenge endpoints
    let (status, _, _) = send(&app, get("/api/speed-challenge")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

fn decode_claims(token: &str) -> Value {
    let payload = token.split('.').nth(1).unwrap();
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(payload).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_bad_json_is_400() {
    let request = Request::post("/v1/token/verify")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, err) = send(&app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "bad_request");

    let request = Request::post("/v1/sessions/tap").body(Body::from("[]")).unwrap();
    let (status, _, _) = send(&app(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_agent_registration() {
    let app = app();
    let (status, _, agent) = send(
        &app,
        post_json(
            "/v1/agents/register/tap?app_id=app_shop",
            &json!({
                "name": "catalog-bot",
                "operator": "Example AI",
                "capabilities": [{"action": "browse", "scope": ["products"]}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{agent}");
    assert_eq!(agent["tap_enabled"], false);
    let agent_id = agent["agent_id"].as_str().unwrap();
    assert!(agent_id.starts_with("agent_"));

    let (status, _, fetched) =
        send(&app, get(&format!("/v1/agents/{agent_id}/tap?app_id=app_shop"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "catalog-bot");

    let (status, _, err) =
        send(&app, get(&format!("/v1/agents/{agent_id}/tap?app_id=app_other"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "agent_not_found");

    let (status, _, list) = send(&app, get("/v1/agents/tap?app_id=app_shop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["count"], 1);
    assert_eq!(list["tap_enabled_count"], 0);

    let (_, _, list) = send(&app, get("/v1/agents/tap?app_id=app_shop&tap_only=true")).await;
    assert_eq!(list["count"], 0);
}

#[tokio::test]
async fn test_registration_requires_app_id() {
    let (status, _, err) =
        send(&app(), post_json("/v1/agents/register/tap", &json!({"name": "orphan"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["error"], "invalid_input");
}

#[tokio::test]
async fn test_unsigned_session() {
    let app = app();
    let (_, _, agent) = send(
        &app,
        post_json(
            "/v1/agents/register/tap",
            &json!({
                "app_id": "app_shop",
                "name": "browser",
                "capabilities": [{"action": "browse"}]
            }),
        ),
    )
    .await;

    let (status, _, created) = send(
        &app,
        post_json(
            "/v1/sessions/tap",
            &json!({
                "agent_id": agent["agent_id"],
                "user_context": "user-1",
                "intent": {"action": "browse", "duration": 600}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["app_id"], "app_shop");
    assert!(created.get("signature").is_none());
    let session_id = created["session_id"].as_str().unwrap();

    let (status, _, view) = send(&app, get(&format!("/v1/sessions/{session_id}/tap"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["agent_id"], agent["agent_id"]);
    let remaining = view["time_remaining_ms"].as_u64().unwrap();
    assert!(remaining > 0 && remaining <= 600_000);

    let purchase = json!({"agent_id": agent["agent_id"], "intent": {"action": "purchase"}});
    let (status, _, err) = send(&app, post_json("/v1/sessions/tap", &purchase)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "insufficient_capability");

    let (status, _, err) = send(&app, get("/v1/sessions/session_missing/tap")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["error"], "session_not_found");
}

#[tokio::test]
async fn test_signed_session() {
    let app = app();
    let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
    let public_pem = p256::PublicKey::from(signing_key.verifying_key())
        .to_public_key_pem(LineEnding::LF)
        .unwrap();

    let (status, _, agent) = send(
        &app,
        post_json(
            "/v1/agents/register/tap?app_id=app_shop",
            &json!({
                "name": "buyer",
                "public_key": public_pem,
                "capabilities": [{"action": "purchase", "restrictions": {"max_amount": 100}}]
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{agent}");
    assert_eq!(agent["tap_enabled"], true);

    let body = json!({
        "agent_id": agent["agent_id"],
        "app_id": "app_shop",
        "intent": {"action": "purchase", "amount": 40}
    })
    .to_string();
    let digest = compute_content_digest(body.as_bytes());
    let unsigned = vec![
        ("host".to_owned(), "botcha.test".to_owned()),
        ("content-digest".to_owned(), digest.clone()),
    ];
    let components: Vec<String> =
        ["@method", "@authority", "@path", "content-digest"].map(str::to_owned).to_vec();
    let params = format!(
        concat!(
            r#"("@method" "@authority" "@path" "content-digest");created={}"#,
            r#";keyid="buyer-key";alg="ecdsa-p256-sha256";nonce="api-1""#,
        ),
        now_secs()
    );
    let request = SignedRequest {
        method: "POST",
        path: "/v1/sessions/tap",
        query: None,
        authority: None,
        headers: &unsigned,
        body: body.as_bytes(),
    };
    let base = build_signature_base(&request, &components, &params).unwrap();
    let signature: Signature = signing_key.sign(base.as_bytes());
    let signature = format!("sig1=:{}:", STANDARD.encode(signature.to_bytes()));

    let signed = |body: String| {
        Request::post("/v1/sessions/tap")
            .header(header::HOST, "botcha.test")
            .header(header::CONTENT_TYPE, "application/json")
            .header("content-digest", &digest)
            .header("signature-input", format!("sig1={params}"))
            .header("signature", &signature)
            .body(Body::from(body))
            .unwrap()
    };

    let (status, _, created) = send(&app, signed(body.clone())).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["signature"]["key_id"], "buyer-key");

    let agent_id = agent["agent_id"].as_str().unwrap();
    let (_, _, fetched) = send(&app, get(&format!("/v1/agents/{agent_id}/tap"))).await;
    assert!(fetched["last_verified_at"].is_string());

    // nonce already used
    let (status, _, err) = send(&app, signed(body.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "signature_replayed");

    // body no longer matches the digest
    let tampered = body.replace(r#""amount":40"#, r#""amount":90"#);
    let (status, _, err) = send(&app, signed(tampered)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["error"], "signature_invalid");
}

#[tokio::test]
async fn test_signature_verify_requires_agent_header() {
    let request = Request::post("/v1/signatures/verify")
        .header("signature-input", r#"sig1=("@method");created=1;keyid="k""#)
        .header("signature", "sig1=:AAAA:")
        .body(Body::empty())
        .unwrap();
    let (status, _, err) = send(&app(), request).await;
    assert!(status.is_client_error(), "{status} {err}");
    assert_eq!(err["success"], false);
}
