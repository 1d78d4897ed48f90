//! Server configuration.
//!
//! Loaded from TOML, every field optional except the JWT secret:
//!
//! ```toml
//! bind = "0.0.0.0:8080"
//! # Peers whose X-Forwarded-For / X-Real-IP headers are believed
//! trusted_proxies = ["10.0.0.1"]
//!
//! [tokens]
//! jwt_secret = "change-me-to-32-random-bytes-or-more"
//! access_ttl_secs = 300
//! refresh_ttl_secs = 3600
//!
//! [rate_limit]
//! enabled = true
//! requests_per_hour = 100
//!
//! [signatures]
//! trusted_directory_hosts = ["agents.example.com"]
//! enforce_allow_list = true
//! fetch_timeout_secs = 5
//! directory_cache_ttl_secs = 3600
//!
//! [challenges]
//! default_difficulty = "medium"
//! ```
//!
//! `BOTCHA_CONFIG` names the file (default `botcha.toml`); a missing file means
//! defaults. `BOTCHA_JWT_SECRET` overrides `tokens.jwt_secret`.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use botcha::{
    challenge::Difficulty,
    reliability::RetryPolicy,
    security::RateLimitConfig,
    tap::DirectoryConfig,
    token::TokenConfig,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Result, ServerError};

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "BOTCHA_CONFIG";

/// Environment variable overriding the JWT secret.
pub const JWT_SECRET_ENV: &str = "BOTCHA_JWT_SECRET";

const DEFAULT_CONFIG_PATH: &str = "botcha.toml";

/// Shortest accepted JWT secret, in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
    /// Reverse proxies allowed to report the client address in
    /// `X-Forwarded-For` or `X-Real-IP`. Empty means those headers are ignored.
    pub trusted_proxies: Vec<IpAddr>,
    /// Token settings.
    pub tokens: TokenSettings,
    /// Rate limit settings.
    pub rate_limit: RateLimitSettings,
    /// Signature and key directory settings.
    pub signatures: SignatureSettings,
    /// Challenge settings.
    pub challenges: ChallengeSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            trusted_proxies: Vec::new(),
            tokens: TokenSettings::default(),
            rate_limit: RateLimitSettings::default(),
            signatures: SignatureSettings::default(),
            challenges: ChallengeSettings::default(),
        }
    }
}

/// `[tokens]`
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// HMAC secret.
    pub jwt_secret: String,
    /// Access token lifetime.
    pub access_ttl_secs: u64,
    /// Refresh token lifetime.
    pub refresh_ttl_secs: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self { jwt_secret: String::new(), access_ttl_secs: 300, refresh_ttl_secs: 3600 }
    }
}

impl fmt::Debug for TokenSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSettings")
            .field("jwt_secret", &"[REDACTED]")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

/// `[rate_limit]`
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Turn limiting on or off.
    pub enabled: bool,
    /// Quota per caller per hour.
    pub requests_per_hour: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { enabled: true, requests_per_hour: 100 }
    }
}

/// `[signatures]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignatureSettings {
    /// Hosts allowed to serve key directories.
    pub trusted_directory_hosts: Vec<String>,
    /// Reject directories outside the allow-list.
    pub enforce_allow_list: bool,
    /// Directory fetch timeout.
    pub fetch_timeout_secs: u64,
    /// Directory cache lifetime.
    pub directory_cache_ttl_secs: u64,
}

impl Default for SignatureSettings {
    fn default() -> Self {
        Self {
            trusted_directory_hosts: Vec::new(),
            enforce_allow_list: false,
            fetch_timeout_secs: 5,
            directory_cache_ttl_secs: 3600,
        }
    }
}

/// `[challenges]`
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ChallengeSettings {
    /// Difficulty when `?difficulty=` is absent.
    pub default_difficulty: Difficulty,
}

impl ServerConfig {
    /// Parses a TOML document. Does not validate.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ConfigParse`] on malformed TOML or unknown values.
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Reads `path`, falling back to defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// I/O errors other than "not found", and parse errors.
    pub fn from_path(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                info!(path = %path.display(), "loaded configuration");
                Self::from_toml(&raw)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "configuration file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Loads from `BOTCHA_CONFIG` (or `botcha.toml`), applies environment
    /// overrides, and validates.
    ///
    /// # Errors
    ///
    /// Any load or validation error.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
        let mut config = Self::from_path(&path)?;
        config.apply_env_overrides(std::env::var(JWT_SECRET_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies a `BOTCHA_JWT_SECRET` value, if set and non-empty.
    pub fn apply_env_overrides(&mut self, jwt_secret: Option<String>) {
        if let Some(secret) = jwt_secret.filter(|s| !s.is_empty()) {
            self.tokens.jwt_secret = secret;
        }
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.jwt_secret.len() < MIN_SECRET_LEN {
            return Err(ServerError::Config(format!(
                "tokens.jwt_secret must be at least {MIN_SECRET_LEN} bytes (set {JWT_SECRET_ENV})"
            )));
        }
        if self.tokens.access_ttl_secs == 0 || self.tokens.refresh_ttl_secs == 0 {
            return Err(ServerError::Config("token lifetimes must be positive".into()));
        }
        if self.tokens.refresh_ttl_secs < self.tokens.access_ttl_secs {
            return Err(ServerError::Config(
                "tokens.refresh_ttl_secs must not be shorter than access_ttl_secs".into(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_hour == 0 {
            return Err(ServerError::Config("rate_limit.requests_per_hour must be positive".into()));
        }
        if self.signatures.fetch_timeout_secs == 0 {
            return Err(ServerError::Config(
                "signatures.fetch_timeout_secs must be positive".into(),
            ));
        }
        let signatures = &self.signatures;
        if signatures.enforce_allow_list && signatures.trusted_directory_hosts.is_empty() {
            return Err(ServerError::Config(
                "signatures.enforce_allow_list requires trusted_directory_hosts".into(),
            ));
        }
        Ok(())
    }

    /// Token lifetimes for [`TokenService`](botcha::token::TokenService).
    #[must_use]
    pub const fn token_config(&self) -> TokenConfig {
        TokenConfig {
            access_ttl: Duration::from_secs(self.tokens.access_ttl_secs),
            refresh_ttl: Duration::from_secs(self.tokens.refresh_ttl_secs),
        }
    }

    /// Quota for [`RateLimiter`](botcha::security::RateLimiter).
    #[must_use]
    pub const fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig { requests_per_hour: self.rate_limit.requests_per_hour }
    }

    /// Settings for [`DirectoryResolver`](botcha::tap::DirectoryResolver).
    #[must_use]
    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            trusted_hosts: self
                .signatures
                .trusted_directory_hosts
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
            enforce_allow_list: self.signatures.enforce_allow_list,
            fetch_timeout: Duration::from_secs(self.signatures.fetch_timeout_secs),
            cache_ttl: Duration::from_secs(self.signatures.directory_cache_ttl_secs),
            retry: RetryPolicy::default(),
        }
    }
}
