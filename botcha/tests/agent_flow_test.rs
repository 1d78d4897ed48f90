//! End-to-end tests: prove automation, get tokens, register, open sessions.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use botcha::{
    BotchaError,
    challenge::{ChallengeEngine, Difficulty, solve_speed, solve_standard},
    clock::now_secs,
    security::{RateLimitConfig, RateLimiter},
    store::MemoryStore,
    tap::{
        Capability, RegisterAgent, SessionIntent, SessionManager, SignedRequest, TrustLevel,
        build_signature_base, compute_content_digest,
    },
    token::{
        ExchangeOptions, StoreRevocationList, TokenService, VerifyOptions, exchange_solution,
    },
};
use p256::{
    ecdsa::{Signature, SigningKey, signature::Signer},
    pkcs8::{EncodePublicKey, LineEnding},
};

fn tokens() -> TokenService {
    TokenService::new(b"integration-test-secret-0123456789".to_vec()).unwrap()
}

#[tokio::test]
async fn test_challenge_to_token_flow() {
    let store = Arc::new(MemoryStore::new());
    let engine = ChallengeEngine::new(Arc::clone(&store));
    let tokens = tokens();

    let challenge = engine.issue_speed().await.unwrap();
    let answers = solve_speed(&challenge.problems);
    let options = ExchangeOptions {
        audience: Some("api.shop.example".into()),
        client_ip: Some("203.0.113.7".into()),
        app_id: Some("app_shop".into()),
    };
    let pair = exchange_solution(&engine, &tokens, &challenge.id, &answers, options).await.unwrap();

    let verify = VerifyOptions {
        audience: Some("api.shop.example".into()),
        require_ip: true,
        client_ip: Some("203.0.113.7".into()),
    };
    let claims = tokens.verify(&pair.access_token, &verify).unwrap();
    assert_eq!(claims.sub, challenge.id);
    assert_eq!(claims.solve_time_ms, pair.solve_time_ms);

    // the challenge is spent
    let options = ExchangeOptions::default();
    let again = exchange_solution(&engine, &tokens, &challenge.id, &answers, options)
        .await
        .unwrap_err();
    assert!(matches!(again, BotchaError::ChallengeNotFound));

    // refresh keeps the bindings
    let refreshed = tokens.refresh(&pair.refresh_token).unwrap();
    assert!(tokens.verify(&refreshed.token, &verify).is_ok());

    // revocation
    let revocations = StoreRevocationList::new(Arc::clone(&store));
    tokens.revoke(&pair.access_token, &revocations).await.unwrap();
    let err = tokens
        .verify_with_revocation(&pair.access_token, &verify, &revocations)
        .await
        .unwrap_err();
    assert!(matches!(err, BotchaError::TokenRevoked));
}

#[tokio::test]
async fn test_standard_challenge_flow() {
    let engine = ChallengeEngine::new(Arc::new(MemoryStore::new()));
    let challenge = engine.issue_standard(Difficulty::Easy).await.unwrap();
    let answer = solve_standard(challenge.prime_count, &challenge.salt);

    let solved = engine.verify_standard(&challenge.id, &answer).await.unwrap();
    assert!(solved.solve_time_ms <= challenge.time_limit_ms + 100);
}

#[tokio::test]
async fn test_rate_limit_survives_store_outage() {
    let store = MemoryStore::new();
    let limiter =
        RateLimiter::new(Arc::new(store.clone()), RateLimitConfig { requests_per_hour: 2 });

    assert!(limiter.check("198.51.100.1", None).await.allowed);
    assert!(limiter.check("198.51.100.1", None).await.allowed);
    assert!(!limiter.check("198.51.100.1", None).await.allowed);

    store.set_unavailable(true);
    let decision = limiter.check("198.51.100.1", None).await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 2);
}

#[tokio::test]
async fn test_register_and_open_sessions() {
    let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
    let agent = sessions
        .registry()
        .register(
            "app_shop",
            RegisterAgent {
                name: "catalog-bot".into(),
                operator: Some("Example AI".into()),
                capabilities: vec![Capability::new("browse").with_scope(["products"])],
                trust_level: Some(TrustLevel::Verified),
                ..RegisterAgent::default()
            },
        )
        .await
        .unwrap();

    let intent =
        SessionIntent { resource: Some("products".into()), ..SessionIntent::new("browse") };
    let session =
        sessions.create_session(&agent.agent_id, "app_shop", "user-9", intent).await.unwrap();
    let view = sessions.get_session(&session.session_id).await.unwrap();
    assert_eq!(view.session.capabilities[0].action, "browse");

    let err = sessions
        .create_session(&agent.agent_id, "app_shop", "user-9", SessionIntent::new("purchase"))
        .await
        .unwrap_err();
    assert!(matches!(err, BotchaError::InsufficientCapability(_)));
}

#[tokio::test]
async fn test_signed_session_request() {
    let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
    let public_pem = p256::PublicKey::from(signing_key.verifying_key())
        .to_public_key_pem(LineEnding::LF)
        .unwrap();

    let sessions = SessionManager::new(Arc::new(MemoryStore::new()));
    let agent = sessions
        .registry()
        .register(
            "app_shop",
            RegisterAgent {
                name: "buyer".into(),
                public_key: Some(public_pem),
                capabilities: vec![Capability::new("purchase").with_max_amount(250.0)],
                ..RegisterAgent::default()
            },
        )
        .await
        .unwrap();
    assert!(agent.tap_enabled);

    let body = br#"{"action":"purchase","amount":99}"#;
    let unsigned_headers = vec![
        ("Host".to_owned(), "botcha.example".to_owned()),
        ("Content-Digest".to_owned(), compute_content_digest(body)),
    ];
    let components: Vec<String> =
        ["@method", "@authority", "@path", "content-digest"].map(str::to_owned).to_vec();
    let raw = format!(
        concat!(
            r#"("@method" "@authority" "@path" "content-digest");created={}"#,
            r#";keyid="buyer-1";alg="ecdsa-p256-sha256";nonce="e2e-1""#,
        ),
        now_secs()
    );
    let request = SignedRequest {
        method: "POST",
        path: "/v1/sessions/tap",
        query: None,
        authority: None,
        headers: &unsigned_headers,
        body,
    };
    let base = build_signature_base(&request, &components, &raw).unwrap();
    let signature: Signature = signing_key.sign(base.as_bytes());
    let mut headers = unsigned_headers.clone();
    headers.push(("Signature-Input".to_owned(), format!("sig1={raw}")));
    let encoded = STANDARD.encode(signature.to_bytes());
    headers.push(("Signature".to_owned(), format!("sig1=:{encoded}:")));

    let signed = SignedRequest { headers: &headers, ..request };
    let intent = SessionIntent { amount: Some(99.0), ..SessionIntent::new("purchase") };
    let (session, verified) = sessions
        .create_verified_session(&signed, &agent.agent_id, "app_shop", "user-1", intent.clone())
        .await
        .unwrap();
    assert_eq!(verified.key_id, "buyer-1");
    assert_eq!(session.intent, intent);

    let refreshed = sessions.registry().get(&agent.agent_id).await.unwrap();
    assert!(refreshed.last_verified_at.is_some());

    // same nonce again
    let err = sessions
        .create_verified_session(&signed, &agent.agent_id, "app_shop", "user-1", intent)
        .await
        .unwrap_err();
    assert!(matches!(err, BotchaError::SignatureReplayed));
}
