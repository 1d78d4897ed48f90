//! Capability-scoped TAP sessions.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    agent::{AgentRegistry, TapAgent},
    capability::{Capability, SessionIntent, authorize},
    verifier::{SignedRequest, TapVerifier, VerificationKey, VerifiedSignature},
};
use crate::{
    audit,
    error::{BotchaError, Result},
    security::AuditEventType,
    store::{KvStore, get_json, put_json},
};

/// Session length when the intent does not ask for one.
pub const DEFAULT_SESSION_SECS: i64 = 3600;

/// Longest session that can be granted.
pub const MAX_SESSION_SECS: i64 = 86_400;

/// An open session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapSession {
    /// Session id.
    pub session_id: String,
    /// Agent the session belongs to.
    pub agent_id: String,
    /// Application the agent belongs to.
    pub app_id: String,
    /// Opaque caller-supplied context, e.g. a user reference.
    pub user_context: String,
    /// The intent that was authorized.
    pub intent: SessionIntent,
    /// Capabilities that granted the intent, frozen at creation.
    pub capabilities: Vec<Capability>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
}

impl TapSession {
    /// Milliseconds left at `now`, never negative.
    #[must_use]
    pub fn time_remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((self.expires_at - now).num_milliseconds()).unwrap_or(0)
    }
}

/// A session together with its remaining lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    /// The session record.
    #[serde(flatten)]
    pub session: TapSession,
    /// Milliseconds until expiry.
    pub time_remaining_ms: u64,
}

/// Clamps a requested duration to `[1, MAX_SESSION_SECS]`.
///
/// # Examples
///
/// ```
/// use botcha::tap::clamp_session_duration;
///
/// assert_eq!(clamp_session_duration(None), 3600);
/// assert_eq!(clamp_session_duration(Some(100_000)), 86_400);
/// assert_eq!(clamp_session_duration(Some(-5)), 1);
/// ```
#[must_use]
pub fn clamp_session_duration(requested: Option<i64>) -> i64 {
    requested.unwrap_or(DEFAULT_SESSION_SECS).clamp(1, MAX_SESSION_SECS)
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Authorizes intents and stores sessions.
#[derive(Debug)]
pub struct SessionManager<S> {
    store: Arc<S>,
    registry: AgentRegistry<S>,
    verifier: TapVerifier<S>,
}

impl<S: KvStore> SessionManager<S> {
    /// Creates a manager sharing `store` with its registry and verifier.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            registry: AgentRegistry::new(Arc::clone(&store)),
            verifier: TapVerifier::new(Arc::clone(&store)),
            store,
        }
    }

    /// The agent registry sessions are checked against.
    #[must_use]
    pub const fn registry(&self) -> &AgentRegistry<S> {
        &self.registry
    }

    /// Opens a session if the agent's current capabilities grant `intent`.
    ///
    /// # Errors
    ///
    /// - [`BotchaError::AgentNotFound`] if the agent is absent or belongs to another app
    /// - [`BotchaError::InsufficientCapability`] / [`BotchaError::RestrictionViolated`]
    /// - [`BotchaError::StorageUnavailable`] if the session cannot be stored
    #[instrument(skip(self, user_context, intent), fields(action = %intent.action))]
    pub async fn create_session(
        &self,
        agent_id: &str,
        app_id: &str,
        user_context: &str,
        intent: SessionIntent,
    ) -> Result<TapSession> {
        let agent = self.registry.get_for_app(agent_id, app_id).await?;
        self.open(&agent, user_context, intent).await
    }

    /// Like [`create_session`](Self::create_session), but first verifies the
    /// request's HTTP message signature against the agent's registered key and
    /// records the outcome on the agent.
    ///
    /// # Errors
    ///
    /// Everything [`create_session`](Self::create_session) returns, plus
    /// [`BotchaError::SignatureMissingHeaders`] when the agent has no key and
    /// any signature verification error.
    #[instrument(skip(self, request, user_context, intent), fields(action = %intent.action))]
    pub async fn create_verified_session(
        &self,
        request: &SignedRequest<'_>,
        agent_id: &str,
        app_id: &str,
        user_context: &str,
        intent: SessionIntent,
    ) -> Result<(TapSession, VerifiedSignature)> {
        let agent = self.registry.get_for_app(agent_id, app_id).await?;
        let (Some(public_key), Some(algorithm)) = (&agent.public_key, agent.signature_algorithm)
        else {
            warn!(%agent_id, "agent has no registered key");
            return Err(BotchaError::SignatureMissingHeaders);
        };

        let key = VerificationKey { key_id: None, public_key: public_key.clone(), algorithm };
        let verified = self.verifier.verify_with_key(request, &key).await;
        self.registry.mark_verified(agent_id, verified.is_ok()).await?;
        let verified = verified?;

        let session = self.open(&agent, user_context, intent).await?;
        Ok((session, verified))
    }

    async fn open(
        &self,
        agent: &TapAgent,
        user_context: &str,
        intent: SessionIntent,
    ) -> Result<TapSession> {
        let capabilities = match authorize(&agent.capabilities, &intent) {
            Ok(granted) => granted,
            Err(e) => {
                warn!(agent_id = %agent.agent_id, reason = e.kind(), "session denied");
                audit!(
                    AuditEventType::SessionDenied,
                    agent.agent_id.as_str(),
                    Uuid::new_v4(),
                    with_app_id(agent.app_id.as_str()),
                    with_error(e.to_string()),
                );
                return Err(e);
            }
        };

        let duration = clamp_session_duration(intent.duration_seconds);
        let created_at = Utc::now();
        let session = TapSession {
            session_id: Uuid::new_v4().to_string(),
            agent_id: agent.agent_id.clone(),
            app_id: agent.app_id.clone(),
            user_context: user_context.to_owned(),
            intent,
            capabilities,
            created_at,
            expires_at: created_at + TimeDelta::seconds(duration),
        };

        let ttl = Duration::from_secs(duration.unsigned_abs());
        let key = session_key(&session.session_id);
        put_json(self.store.as_ref(), &key, &session, Some(ttl)).await?;

        info!(session_id = %session.session_id, duration, "session created");
        audit!(
            AuditEventType::SessionCreated,
            agent.agent_id.as_str(),
            Uuid::new_v4(),
            with_app_id(agent.app_id.as_str()),
            with_session_id(session.session_id.as_str()),
        );
        Ok(session)
    }

    /// Looks up a live session.
    ///
    /// # Errors
    ///
    /// [`BotchaError::SessionNotFound`] if absent or expired; storage failures propagate.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionView> {
        let session: TapSession = get_json(self.store.as_ref(), &session_key(session_id))
            .await?
            .ok_or(BotchaError::SessionNotFound)?;

        let time_remaining_ms = session.time_remaining_ms(Utc::now());
        if time_remaining_ms == 0 {
            return Err(BotchaError::SessionNotFound);
        }
        Ok(SessionView { session, time_remaining_ms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryStore,
        tap::{
            agent::RegisterAgent,
            verifier::test_keys::{EcdsaSigner, sign_request},
        },
    };

    async fn setup(public_key: Option<String>) -> (SessionManager<MemoryStore>, TapAgent) {
        let manager = SessionManager::new(Arc::new(MemoryStore::new()));
        let agent = manager
            .registry()
            .register(
                "app_1",
                RegisterAgent {
                    name: "shopper".into(),
                    public_key,
                    capabilities: vec![
                        Capability::new("browse").with_scope(["products"]),
                        Capability::new("purchase").with_max_amount(100.0),
                    ],
                    ..RegisterAgent::default()
                },
            )
            .await
            .unwrap();
        (manager, agent)
    }

    fn browse() -> SessionIntent {
        SessionIntent { resource: Some("products".into()), ..SessionIntent::new("browse") }
    }

    #[test]
    fn test_clamp_session_duration() {
        assert_eq!(clamp_session_duration(Some(0)), 1);
        assert_eq!(clamp_session_duration(Some(600)), 600);
        assert_eq!(clamp_session_duration(Some(i64::MAX)), MAX_SESSION_SECS);
    }

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (manager, agent) = setup(None).await;
        let session =
            manager.create_session(&agent.agent_id, "app_1", "user-42", browse()).await.unwrap();

        assert_eq!(session.capabilities.len(), 1);
        assert_eq!((session.expires_at - session.created_at).num_seconds(), DEFAULT_SESSION_SECS);

        let view = manager.get_session(&session.session_id).await.unwrap();
        assert_eq!(view.session, session);
        assert!(view.time_remaining_ms > 0);
        assert!(view.time_remaining_ms <= 3_600_000);
    }

    #[tokio::test]
    async fn test_duration_clamped_to_a_day() {
        let (manager, agent) = setup(None).await;
        let intent = SessionIntent { duration_seconds: Some(100_000), ..browse() };
        let session = manager.create_session(&agent.agent_id, "app_1", "", intent).await.unwrap();

        assert!((session.expires_at - session.created_at).num_seconds() <= MAX_SESSION_SECS);
    }

    #[tokio::test]
    async fn test_capability_denials() {
        let (manager, agent) = setup(None).await;

        let err = manager
            .create_session(&agent.agent_id, "app_1", "", SessionIntent::new("delete"))
            .await
            .unwrap_err();
        assert!(matches!(err, BotchaError::InsufficientCapability(_)));

        let expensive = SessionIntent { amount: Some(500.0), ..SessionIntent::new("purchase") };
        let err =
            manager.create_session(&agent.agent_id, "app_1", "", expensive).await.unwrap_err();
        assert!(matches!(err, BotchaError::RestrictionViolated(_)));
    }

    #[tokio::test]
    async fn test_unknown_agent_and_session() {
        let (manager, agent) = setup(None).await;
        assert!(matches!(
            manager.create_session("agent_missing", "app_1", "", browse()).await,
            Err(BotchaError::AgentNotFound)
        ));
        assert!(matches!(
            manager.create_session(&agent.agent_id, "app_other", "", browse()).await,
            Err(BotchaError::AgentNotFound)
        ));
        assert!(matches!(manager.get_session("nope").await, Err(BotchaError::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_expired_session_not_found() {
        let (manager, agent) = setup(None).await;
        let mut session =
            manager.create_session(&agent.agent_id, "app_1", "", browse()).await.unwrap();

        // store entry outlives the session itself
        session.expires_at = Utc::now() - TimeDelta::seconds(1);
        put_json(manager.store.as_ref(), &session_key(&session.session_id), &session, None)
            .await
            .unwrap();

        assert!(matches!(
            manager.get_session(&session.session_id).await,
            Err(BotchaError::SessionNotFound)
        ));
    }

    #[test]
    fn test_time_remaining_never_negative() {
        let now = Utc::now();
        let session = TapSession {
            session_id: "s".into(),
            agent_id: "a".into(),
            app_id: "app".into(),
            user_context: String::new(),
            intent: browse(),
            capabilities: Vec::new(),
            created_at: now - TimeDelta::seconds(10),
            expires_at: now - TimeDelta::seconds(5),
        };
        assert_eq!(session.time_remaining_ms(now), 0);
        assert_eq!(session.time_remaining_ms(now - TimeDelta::seconds(6)), 1000);
    }

    #[tokio::test]
    async fn test_verified_session() {
        let signer = EcdsaSigner::generate();
        let (manager, agent) = setup(Some(signer.public_pem.clone())).await;
        let unsigned = SignedRequest {
            method: "POST",
            path: "/v1/sessions/tap",
            query: None,
            authority: Some("botcha.example"),
            headers: &[],
            body: b"",
        };
        let headers = sign_request(&signer, &unsigned, &["@method", "@path"], ";keyid=\"k\"");
        let signed = SignedRequest { headers: &headers, ..unsigned };

        let (session, verified) = manager
            .create_verified_session(&signed, &agent.agent_id, "app_1", "", browse())
            .await
            .unwrap();
        assert_eq!(verified.key_id, "k");
        assert_eq!(session.agent_id, agent.agent_id);

        let stored = manager.registry().get(&agent.agent_id).await.unwrap();
        assert!(stored.last_verified_at.is_some());
    }

    #[tokio::test]
    async fn test_verified_session_bad_signature() {
        let signer = EcdsaSigner::generate();
        let other = EcdsaSigner::generate();
        let (manager, agent) = setup(Some(signer.public_pem.clone())).await;
        let unsigned = SignedRequest {
            method: "POST",
            path: "/v1/sessions/tap",
            query: None,
            authority: None,
            headers: &[],
            body: b"",
        };
        let headers = sign_request(&other, &unsigned, &["@method"], ";keyid=\"k\"");
        let signed = SignedRequest { headers: &headers, ..unsigned };

        let err = manager
            .create_verified_session(&signed, &agent.agent_id, "app_1", "", browse())
            .await
            .unwrap_err();
        assert!(matches!(err, BotchaError::SignatureInvalid));
        assert!(manager.registry().get(&agent.agent_id).await.unwrap().last_verified_at.is_none());
    }
}
