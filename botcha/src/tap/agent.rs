//! TAP agent registration and lookup.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    capability::Capability,
    verifier::{SignatureAlgorithm, detect_algorithm, validate_public_key},
};
use crate::{
    audit,
    error::{BotchaError, Result},
    reliability::{fail_open, fail_open_or_default},
    security::AuditEventType,
    store::{KvStore, get_json, put_json},
};

/// How much an agent's operator has been vetted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Self-registered.
    #[default]
    Basic,
    /// Operator identity confirmed.
    Verified,
    /// Contracted operator.
    Enterprise,
}

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapAgent {
    /// `agent_` followed by 16 hex characters.
    pub agent_id: String,
    /// Owning application.
    pub app_id: String,
    /// Display name.
    pub name: String,
    /// Operator, if declared.
    pub operator: Option<String>,
    /// SPKI PEM public key for HTTP message signatures.
    pub public_key: Option<String>,
    /// Algorithm of `public_key`.
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// Declared capabilities.
    pub capabilities: Vec<Capability>,
    /// Trust tier.
    pub trust_level: TrustLevel,
    /// `true` iff a public key is registered.
    pub tap_enabled: bool,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Last successful signature verification.
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// Registration request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterAgent {
    /// Display name.
    pub name: String,
    /// Operator.
    #[serde(default)]
    pub operator: Option<String>,
    /// SPKI PEM public key.
    #[serde(default)]
    pub public_key: Option<String>,
    /// Algorithm of `public_key`; detected from the key when omitted.
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Trust tier, `basic` when omitted.
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
}

/// Result of [`AgentRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentList {
    /// Matching agents, oldest first.
    pub agents: Vec<TapAgent>,
    /// `agents.len()`.
    pub count: usize,
    /// Agents in `agents` with a public key.
    pub tap_enabled_count: usize,
}

fn agent_key(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

fn app_index_key(app_id: &str) -> String {
    format!("app_agents:{app_id}")
}

fn new_agent_id() -> String {
    format!("agent_{}", hex::encode(rand::random::<[u8; 8]>()))
}

/// Persists agents and an index of agent ids per app.
///
/// Index updates for one app are serialized, so concurrent registrations
/// never drop each other's entries. Clones share the locks.
#[derive(Debug)]
pub struct AgentRegistry<S> {
    store: Arc<S>,
    index_locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl<S> Clone for AgentRegistry<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), index_locks: Arc::clone(&self.index_locks) }
    }
}

impl<S: KvStore> AgentRegistry<S> {
    /// Creates a registry over `store`.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store, index_locks: Arc::default() }
    }

    async fn index_lock(&self, app_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.index_locks.lock().await;
        Arc::clone(locks.entry(app_id.to_owned()).or_default())
    }

    /// Registers a new agent under `app_id`.
    ///
    /// # Errors
    ///
    /// - [`BotchaError::InvalidInput`] for an empty name or app id
    /// - [`BotchaError::CryptoError`] if the public key does not parse for its algorithm
    /// - [`BotchaError::StorageUnavailable`] if the index or record cannot be
    ///   written
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn register(&self, app_id: &str, request: RegisterAgent) -> Result<TapAgent> {
        if app_id.trim().is_empty() {
            return Err(BotchaError::InvalidInput("app_id is required".into()));
        }
        if request.name.trim().is_empty() {
            return Err(BotchaError::InvalidInput("name is required".into()));
        }

        let public_key = request.public_key.filter(|k| !k.trim().is_empty());
        let signature_algorithm = match (&public_key, request.signature_algorithm) {
            (Some(key), Some(alg)) => {
                validate_public_key(key, alg)?;
                Some(alg)
            }
            (Some(key), None) => Some(detect_algorithm(key)?),
            (None, _) => None,
        };

        let agent = TapAgent {
            agent_id: new_agent_id(),
            app_id: app_id.to_owned(),
            name: request.name,
            operator: request.operator,
            tap_enabled: public_key.is_some(),
            public_key,
            signature_algorithm,
            capabilities: request.capabilities,
            trust_level: request.trust_level.unwrap_or_default(),
            created_at: Utc::now(),
            last_verified_at: None,
        };

        // index before record; `list` skips dangling ids
        let lock = self.index_lock(app_id).await;
        let _guard = lock.lock().await;

        let store = self.store.as_ref();
        let index_key = app_index_key(app_id);
        let mut index: Vec<String> = get_json(store, &index_key).await?.unwrap_or_default();
        index.push(agent.agent_id.clone());
        put_json(store, &index_key, &index, None).await?;

        if let Err(e) = put_json(store, &agent_key(&agent.agent_id), &agent, None).await {
            index.pop();
            if let Err(rollback) = put_json(store, &index_key, &index, None).await {
                warn!(agent_id = %agent.agent_id, error = %rollback, "index rollback failed");
            }
            return Err(e);
        }

        info!(agent_id = %agent.agent_id, tap_enabled = agent.tap_enabled, "agent registered");
        audit!(
            AuditEventType::AgentRegistered,
            agent.agent_id.as_str(),
            Uuid::new_v4(),
            with_app_id(app_id),
        );
        Ok(agent)
    }

    /// Fetches an agent by id.
    ///
    /// # Errors
    ///
    /// [`BotchaError::AgentNotFound`] if absent; storage failures propagate.
    pub async fn get(&self, agent_id: &str) -> Result<TapAgent> {
        get_json(self.store.as_ref(), &agent_key(agent_id))
            .await?
            .ok_or(BotchaError::AgentNotFound)
    }

    /// Fetches an agent, hiding agents that belong to other apps.
    ///
    /// # Errors
    ///
    /// [`BotchaError::AgentNotFound`] if absent or owned by another app.
    pub async fn get_for_app(&self, agent_id: &str, app_id: &str) -> Result<TapAgent> {
        let agent = self.get(agent_id).await?;
        if agent.app_id == app_id { Ok(agent) } else { Err(BotchaError::AgentNotFound) }
    }

    /// Lists an app's agents, optionally only those with a public key.
    ///
    /// Index entries whose record has disappeared are skipped.
    ///
    /// # Errors
    ///
    /// Storage failures propagate.
    pub async fn list(&self, app_id: &str, tap_only: bool) -> Result<AgentList> {
        let index: Vec<String> =
            get_json(self.store.as_ref(), &app_index_key(app_id)).await?.unwrap_or_default();

        let mut agents = Vec::with_capacity(index.len());
        for agent_id in &index {
            match get_json::<_, TapAgent>(self.store.as_ref(), &agent_key(agent_id)).await? {
                Some(agent) if agent.app_id == app_id && (!tap_only || agent.tap_enabled) => {
                    agents.push(agent);
                }
                Some(_) => {}
                None => debug!(%agent_id, "dangling agent index entry"),
            }
        }

        let tap_enabled_count = agents.iter().filter(|a| a.tap_enabled).count();
        Ok(AgentList { count: agents.len(), tap_enabled_count, agents })
    }

    /// Records a verification attempt. Only a success updates
    /// `last_verified_at`; the agent is never disabled. Storage failures are
    /// swallowed.
    ///
    /// # Errors
    ///
    /// Only non-infrastructure errors (none in practice).
    pub async fn mark_verified(&self, agent_id: &str, success: bool) -> Result<()> {
        if !success {
            debug!(%agent_id, "verification failed, timestamp unchanged");
            return Ok(());
        }

        let key = agent_key(agent_id);
        let agent: Option<TapAgent> =
            fail_open("tap.mark_verified_read", get_json(self.store.as_ref(), &key), None).await?;
        let Some(mut agent) = agent else {
            return Ok(());
        };

        agent.last_verified_at = Some(Utc::now());
        fail_open_or_default(
            "tap.mark_verified_write",
            put_json(self.store.as_ref(), &key, &agent, None),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::MemoryStore, tap::verifier::test_keys::EcdsaSigner};

    fn registry() -> (AgentRegistry<MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        (AgentRegistry::new(Arc::new(store.clone())), store)
    }

    fn request(name: &str) -> RegisterAgent {
        RegisterAgent {
            name: name.into(),
            capabilities: vec![Capability::new("browse").with_scope(["products"])],
            ..RegisterAgent::default()
        }
    }

    #[tokio::test]
    async fn test_register_without_key() {
        let (registry, _) = registry();
        let agent = registry.register("app_1", request("crawler")).await.unwrap();

        assert!(agent.agent_id.starts_with("agent_"));
        assert_eq!(agent.agent_id.len(), "agent_".len() + 16);
        assert!(!agent.tap_enabled);
        assert_eq!(agent.trust_level, TrustLevel::Basic);
        assert_eq!(registry.get(&agent.agent_id).await.unwrap(), agent);
    }

    #[tokio::test]
    async fn test_register_with_key_detects_algorithm() {
        let (registry, _) = registry();
        let signer = EcdsaSigner::generate();
        let req =
            RegisterAgent { public_key: Some(signer.public_pem.clone()), ..request("shopper") };

        let agent = registry.register("app_1", req).await.unwrap();
        assert!(agent.tap_enabled);
        assert_eq!(agent.signature_algorithm, Some(SignatureAlgorithm::EcdsaP256Sha256));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_input() {
        let (registry, _) = registry();

        let err = registry.register("app_1", request("  ")).await.unwrap_err();
        assert!(matches!(err, BotchaError::InvalidInput(_)));

        let req = RegisterAgent { public_key: Some("garbage".into()), ..request("x") };
        assert!(matches!(registry.register("app_1", req).await, Err(BotchaError::CryptoError(_))));

        let signer = EcdsaSigner::generate();
        let req = RegisterAgent {
            public_key: Some(signer.public_pem),
            signature_algorithm: Some(SignatureAlgorithm::RsaPssSha256),
            ..request("x")
        };
        assert!(matches!(registry.register("app_1", req).await, Err(BotchaError::CryptoError(_))));
    }

    #[tokio::test]
    async fn test_get_missing_and_foreign() {
        let (registry, _) = registry();
        assert!(matches!(registry.get("agent_nope").await, Err(BotchaError::AgentNotFound)));

        let agent = registry.register("app_1", request("a")).await.unwrap();
        assert!(registry.get_for_app(&agent.agent_id, "app_1").await.is_ok());
        assert!(matches!(
            registry.get_for_app(&agent.agent_id, "app_2").await,
            Err(BotchaError::AgentNotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (registry, _) = registry();
        let signer = EcdsaSigner::generate();
        registry.register("app_1", request("plain")).await.unwrap();
        let signed = RegisterAgent { public_key: Some(signer.public_pem), ..request("signed") };
        registry.register("app_1", signed).await.unwrap();
        registry.register("app_2", request("other")).await.unwrap();

        let all = registry.list("app_1", false).await.unwrap();
        assert_eq!(all.count, 2);
        assert_eq!(all.tap_enabled_count, 1);

        let tap_only = registry.list("app_1", true).await.unwrap();
        assert_eq!(tap_only.count, 1);
        assert_eq!(tap_only.agents[0].name, "signed");

        assert_eq!(registry.list("app_3", false).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_mark_verified() {
        let (registry, store) = registry();
        let agent = registry.register("app_1", request("a")).await.unwrap();

        registry.mark_verified(&agent.agent_id, false).await.unwrap();
        assert!(registry.get(&agent.agent_id).await.unwrap().last_verified_at.is_none());

        registry.mark_verified(&agent.agent_id, true).await.unwrap();
        let updated = registry.get(&agent.agent_id).await.unwrap();
        assert!(updated.last_verified_at.is_some());
        assert!(updated.tap_enabled == agent.tap_enabled);

        store.set_unavailable(true);
        assert!(registry.mark_verified(&agent.agent_id, true).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_record_write_fault() {
        let (registry, store) = registry();
        let kept = registry.register("app_1", request("kept")).await.unwrap();

        store.fail_writes_with_prefix(Some("agent:")).await;
        let err = registry.register("app_1", request("lost")).await.unwrap_err();
        assert!(matches!(err, BotchaError::StorageUnavailable(_)));
        store.fail_writes_with_prefix(None).await;

        let index: Vec<String> =
            get_json(&store, &app_index_key("app_1")).await.unwrap().unwrap_or_default();
        assert_eq!(index, vec![kept.agent_id.clone()]);
        assert_eq!(registry.list("app_1", false).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_register_index_write_fault() {
        let (registry, store) = registry();
        store.fail_writes_with_prefix(Some("app_agents:")).await;

        let err = registry.register("app_1", request("a")).await.unwrap_err();
        assert!(matches!(err, BotchaError::StorageUnavailable(_)));
        // nothing written, so no unlisted record exists
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_list_skips_dangling_entries() {
        let (registry, store) = registry();
        let agent = registry.register("app_1", request("a")).await.unwrap();
        let index = vec!["agent_gone".to_owned(), agent.agent_id.clone()];
        put_json(&store, &app_index_key("app_1"), &index, None).await.unwrap();

        let list = registry.list("app_1", false).await.unwrap();
        assert_eq!(list.count, 1);
        assert_eq!(list.agents[0].agent_id, agent.agent_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations_all_indexed() {
        let (registry, _) = registry();
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry.register("app_1", request(&format!("agent-{i}"))).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(registry.list("app_1", false).await.unwrap().count, 16);
    }
}
