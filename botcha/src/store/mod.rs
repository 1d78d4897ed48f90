//! Key/value storage abstraction.
//!
//! Every piece of BOTCHA state (challenges, rate-limit windows, agents, sessions,
//! revocations, cached key directories, signature nonces) lives in a [`KvStore`].
//! Values are opaque strings; most callers go through [`get_json`] and
//! [`put_json`], which layer `serde_json` on top.
//!
//! The store is a distributed cache in production: there is no compare-and-swap,
//! and concurrent writers race with last-writer-wins semantics. Callers that can
//! tolerate that (rate limiting, `last_verified_at`) are written accordingly.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use botcha::store::{KvStore, MemoryStore};
//!
//! # async fn example() -> botcha::error::Result<()> {
//! let store = MemoryStore::new();
//! store.put("greeting", "hello".into(), Some(Duration::from_secs(60))).await?;
//! assert_eq!(store.get("greeting").await?.as_deref(), Some("hello"));
//! # Ok(())
//! # }
//! ```

#[allow(
    redundant_imports,
    reason = "Future needed for RPITIT despite being in Edition 2024 prelude"
)]
use std::future::Future;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::Result;

mod memory;

pub use memory::MemoryStore;

/// Asynchronous string key/value store with optional per-entry TTL.
///
/// Implementations report backend failures as
/// [`BotchaError::StorageUnavailable`](crate::error::BotchaError::StorageUnavailable)
/// so that fail-open callers can recognise them.
pub trait KvStore: Send + Sync {
    /// Fetches a value, returning `None` when absent or expired.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::StorageUnavailable`](crate::error::BotchaError::StorageUnavailable)
    /// if the backend cannot be reached.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Stores a value, replacing any existing entry. `None` TTL means no expiry.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::StorageUnavailable`](crate::error::BotchaError::StorageUnavailable)
    /// if the backend cannot be reached.
    fn put(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Removes a value. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BotchaError::StorageUnavailable`](crate::error::BotchaError::StorageUnavailable)
    /// if the backend cannot be reached.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Reads and decodes a JSON value.
///
/// # Errors
///
/// Propagates store failures and returns
/// [`BotchaError::Serialization`](crate::error::BotchaError::Serialization) for
/// corrupt entries.
pub async fn get_json<S, T>(store: &S, key: &str) -> Result<Option<T>>
where
    S: KvStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON value.
///
/// # Errors
///
/// Propagates store failures and serialization errors.
pub async fn put_json<S, T>(store: &S, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
where
    S: KvStore + ?Sized,
    T: Serialize + Sync,
{
    let raw = serde_json::to_string(value)?;
    store.put(key, raw, ttl).await
}
