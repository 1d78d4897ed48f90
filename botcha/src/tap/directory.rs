//! Signature-agent key directories.
//!
//! An agent advertises where its public keys live through the
//! `Signature-Agent` header. The directory is a small JSON document:
//!
//! ```json
//! {
//!   "agent_name": "ShopBot",
//!   "provider_name": "Example AI",
//!   "keys": [{ "kid": "key-1", "public_key": "-----BEGIN PUBLIC KEY-----...", "alg": "ES256" }]
//! }
//! ```
//!
//! Documents are fetched over HTTPS only, cached in the store for an hour, and
//! optionally restricted to an allow-list of hosts.

use std::{collections::HashSet, sync::Arc, time::Duration};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::verifier::{SignatureAlgorithm, VerificationKey};
use crate::{
    error::{BotchaError, Result},
    reliability::{RetryPolicy, fail_open, fail_open_or_default, retry_with_backoff},
    store::{KvStore, get_json, put_json},
};

/// Default time a fetched directory stays cached.
pub const DIRECTORY_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default timeout for a single directory fetch.
pub const DIRECTORY_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// One key published in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryKey {
    /// Key identifier matched against `keyid`.
    #[serde(alias = "kid", alias = "keyId")]
    pub key_id: String,
    /// SPKI PEM public key.
    #[serde(alias = "publicKey")]
    pub public_key: String,
    /// Algorithm name.
    #[serde(alias = "alg")]
    pub algorithm: String,
}

/// A signer's key directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDirectory {
    /// Name of the agent.
    #[serde(alias = "agentName")]
    pub agent_name: String,
    /// Operator of the agent.
    #[serde(alias = "providerName")]
    pub provider_name: String,
    /// Published keys.
    #[serde(default)]
    pub keys: Vec<DirectoryKey>,
}

impl KeyDirectory {
    /// Looks up a key by id.
    #[must_use]
    pub fn key(&self, key_id: &str) -> Option<&DirectoryKey> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }
}

/// Directory resolution settings.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Hosts allowed to serve directories.
    pub trusted_hosts: HashSet<String>,
    /// Reject hosts outside `trusted_hosts`.
    pub enforce_allow_list: bool,
    /// Per-attempt fetch timeout.
    pub fetch_timeout: Duration,
    /// Cache lifetime.
    pub cache_ttl: Duration,
    /// Retry policy for fetches.
    pub retry: RetryPolicy,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            trusted_hosts: HashSet::new(),
            enforce_allow_list: false,
            fetch_timeout: DIRECTORY_FETCH_TIMEOUT,
            cache_ttl: DIRECTORY_CACHE_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

fn cache_key(url: &Url) -> String {
    format!("tap:directory:{url}")
}

/// Fetches and caches key directories.
#[derive(Debug)]
pub struct DirectoryResolver<S> {
    client: Client,
    store: Arc<S>,
    config: DirectoryConfig,
}

impl<S: KvStore> DirectoryResolver<S> {
    /// Creates a resolver.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::HttpError`] if the HTTP client cannot be built.
    pub fn new(store: Arc<S>, config: DirectoryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .user_agent(concat!("botcha/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, store, config })
    }

    /// Resolution settings.
    #[must_use]
    pub const fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Validates `raw` and checks its host against the allow-list.
    ///
    /// # Errors
    ///
    /// - [`BotchaError::InvalidDirectoryUrl`] if it is not an `https` URL with a host
    /// - [`BotchaError::UntrustedProvider`] if the host is not allowed
    pub fn check_url(&self, raw: &str) -> Result<Url> {
        let url = Url::parse(raw)
            .map_err(|e| BotchaError::InvalidDirectoryUrl(format!("{raw}: {e}")))?;
        if url.scheme() != "https" {
            return Err(BotchaError::InvalidDirectoryUrl(format!("{raw}: must use https")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| BotchaError::InvalidDirectoryUrl(format!("{raw}: missing host")))?
            .to_ascii_lowercase();

        if self.config.enforce_allow_list && !self.config.trusted_hosts.contains(&host) {
            warn!(%host, "directory host not on allow-list");
            return Err(BotchaError::UntrustedProvider(host));
        }
        Ok(url)
    }

    /// Returns the directory at `url`, from cache when possible.
    ///
    /// # Errors
    ///
    /// URL errors from [`check_url`](Self::check_url), or
    /// [`BotchaError::DirectoryUnavailable`] when the fetch fails after retries.
    #[instrument(skip(self))]
    pub async fn resolve(&self, url: &str) -> Result<KeyDirectory> {
        let url = self.check_url(url)?;
        let key = cache_key(&url);

        let cached: Option<KeyDirectory> =
            fail_open("tap.directory_cache_read", get_json(self.store.as_ref(), &key), None).await?;
        if let Some(directory) = cached {
            debug!("directory served from cache");
            return Ok(directory);
        }

        let directory = retry_with_backoff(&self.config.retry, || self.fetch(&url))
            .await
            .map_err(|e| match e {
                BotchaError::DirectoryUnavailable(_) => e,
                other => BotchaError::DirectoryUnavailable(other.to_string()),
            })?;

        fail_open_or_default(
            "tap.directory_cache_write",
            put_json(self.store.as_ref(), &key, &directory, Some(self.config.cache_ttl)),
        )
        .await?;

        info!(agent = %directory.agent_name, keys = directory.keys.len(), "directory fetched");
        Ok(directory)
    }

    /// Resolves `url` and returns the key `key_id` as a [`VerificationKey`].
    ///
    /// # Errors
    ///
    /// Errors from [`resolve`](Self::resolve),
    /// [`BotchaError::SignatureKeyNotFound`] if the directory lacks the key, or
    /// [`BotchaError::UnsupportedAlgorithm`] if it uses an unknown algorithm.
    pub async fn find_key(&self, url: &str, key_id: &str) -> Result<VerificationKey> {
        let directory = self.resolve(url).await?;
        let key = directory
            .key(key_id)
            .ok_or_else(|| BotchaError::SignatureKeyNotFound(key_id.to_owned()))?;

        Ok(VerificationKey {
            key_id: Some(key.key_id.clone()),
            public_key: key.public_key.clone(),
            algorithm: key.algorithm.parse::<SignatureAlgorithm>()?,
        })
    }

    async fn fetch(&self, url: &Url) -> Result<KeyDirectory> {
        let response = self.client.get(url.clone()).send().await?.error_for_status()?;
        Ok(response.json::<KeyDirectory>().await?)
    }
}
