//! Local cache store
//!
//! Synchronous, best-effort durable key-value persistence namespaced by
//! session and slice. It is the warm-start source for every sync unit and
//! the offline fallback when the remote store is unreachable.
//!
//! ## Keys
//!
//! - `cache:{session|guest}:{slice}` - namespaced entries
//! - `{slice}` - legacy unscoped entries, read once for migration
//!
//! ## Failure policy
//!
//! `try_get`/`try_set` return typed [`CacheError`]s. `get`/`set` log failures
//! and carry on: the in-memory value stays authoritative.

pub mod error;
pub mod memory;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::keys::{namespace, SessionId, SliceKey, KEY_SEPARATOR};

pub use error::{CacheError, CacheResult};
pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

/// Prefix shared by all namespaced cache keys
pub const CACHE_PREFIX: &str = "cache";

/// Raw string storage underneath the typed cache
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> CacheResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> CacheResult<()>;
    /// Returns the number of entries removed
    fn remove_prefix(&self, prefix: &str) -> CacheResult<usize>;
    fn keys(&self, prefix: &str) -> CacheResult<Vec<String>>;
    /// Returns the number of entries removed
    fn clear(&self) -> CacheResult<usize>;
}

/// Typed, namespaced view over a [`CacheBackend`]
///
/// Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct LocalCache {
    backend: Arc<dyn CacheBackend>,
    max_entry_bytes: Option<usize>,
}

impl LocalCache {
    pub fn new(backend: impl CacheBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
            max_entry_bytes: None,
        }
    }

    /// Non-durable cache (for tests and ephemeral processes)
    pub fn in_memory() -> Self {
        Self::new(MemoryCache::new())
    }

    /// Open the SQLite cache described by `config`
    pub fn open(config: &Config) -> CacheResult<Self> {
        let backend = SqliteCache::open(&config.cache_path())?;
        Ok(Self::new(backend).with_max_entry_bytes(config.cache_max_entry_bytes))
    }

    /// Reject entries whose serialized form is larger than `limit` bytes
    pub fn with_max_entry_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_entry_bytes = limit;
        self
    }

    /// Namespaced key for a slice: `cache:{session|guest}:{slice}`
    pub fn cache_key(session: Option<&SessionId>, slice: &SliceKey) -> String {
        format!(
            "{CACHE_PREFIX}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            namespace(session),
            slice
        )
    }

    /// Key prefix shared by every entry of one session namespace
    pub fn namespace_prefix(session: Option<&SessionId>) -> String {
        format!(
            "{CACHE_PREFIX}{KEY_SEPARATOR}{}{KEY_SEPARATOR}",
            namespace(session)
        )
    }

    /// Read a slice, migrating a legacy unscoped entry on first miss
    pub fn try_get<T: DeserializeOwned>(
        &self,
        session: Option<&SessionId>,
        slice: &SliceKey,
    ) -> CacheResult<Option<T>> {
        let key = Self::cache_key(session, slice);

        if let Some(raw) = self.backend.get(&key)? {
            return serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| CacheError::Deserialize { key, source });
        }

        let legacy_key = slice.as_str();
        let Some(raw) = self.backend.get(legacy_key)? else {
            return Ok(None);
        };

        let value = serde_json::from_str(&raw).map_err(|source| CacheError::Deserialize {
            key: legacy_key.to_string(),
            source,
        })?;

        // The value is usable even if the migration write fails
        match self.backend.set(&key, &raw) {
            Ok(()) => info!("Migrated legacy cache entry '{}' to '{}'", legacy_key, key),
            Err(e) => warn!("Failed to migrate legacy cache entry '{}': {}", legacy_key, e),
        }

        Ok(Some(value))
    }

    /// Best-effort read; failures are logged and treated as a miss
    pub fn get<T: DeserializeOwned>(
        &self,
        session: Option<&SessionId>,
        slice: &SliceKey,
    ) -> Option<T> {
        match self.try_get(session, slice) {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring unreadable cache entry for '{}': {}", slice, e);
                None
            }
        }
    }

    /// Write a slice value
    pub fn try_set<T: Serialize>(
        &self,
        session: Option<&SessionId>,
        slice: &SliceKey,
        value: &T,
    ) -> CacheResult<()> {
        let key = Self::cache_key(session, slice);
        let raw = serde_json::to_string(value).map_err(|source| CacheError::Serialize {
            key: key.clone(),
            source,
        })?;

        if let Some(limit) = self.max_entry_bytes {
            if raw.len() > limit {
                return Err(CacheError::QuotaExceeded {
                    key,
                    size: raw.len(),
                    limit,
                });
            }
        }

        self.backend.set(&key, &raw)
    }

    /// Best-effort write; failures are logged, never returned
    pub fn set<T: Serialize>(&self, session: Option<&SessionId>, slice: &SliceKey, value: &T) {
        if let Err(e) = self.try_set(session, slice, value) {
            warn!("Local cache write failed for '{}': {}", slice, e);
        }
    }

    /// Remove every entry in one session's namespace
    pub fn clear(&self, session: Option<&SessionId>) {
        match self.backend.remove_prefix(&Self::namespace_prefix(session)) {
            Ok(removed) => debug!(
                "Cleared {} cache entries for '{}'",
                removed,
                namespace(session)
            ),
            Err(e) => warn!(
                "Failed to clear cache for '{}': {}",
                namespace(session),
                e
            ),
        }
    }

    /// Remove every entry, including legacy unscoped ones
    pub fn clear_all(&self) {
        match self.backend.clear() {
            Ok(removed) => info!("Cleared all {} cache entries", removed),
            Err(e) => warn!("Failed to clear cache: {}", e),
        }
    }

    /// Slice keys cached for a session
    pub fn slices(&self, session: Option<&SessionId>) -> CacheResult<Vec<String>> {
        let prefix = Self::namespace_prefix(session);
        Ok(self
            .backend
            .keys(&prefix)?
            .into_iter()
            .map(|key| key[prefix.len()..].to_string())
            .collect())
    }

    /// Every raw key in the cache
    pub fn keys(&self) -> CacheResult<Vec<String>> {
        self.backend.keys("")
    }

    /// Raw key and JSON text of every entry whose key starts with `prefix`
    ///
    /// Entries removed between listing and reading are skipped.
    pub fn entries(&self, prefix: &str) -> CacheResult<Vec<(String, String)>> {
        let mut entries = Vec::new();
        for key in self.backend.keys(prefix)? {
            if let Some(raw) = self.backend.get(&key)? {
                entries.push((key, raw));
            }
        }
        Ok(entries)
    }

    /// Raw JSON text stored under a namespaced slice key
    pub fn raw(
        &self,
        session: Option<&SessionId>,
        slice: &SliceKey,
    ) -> CacheResult<Option<String>> {
        self.backend.get(&Self::cache_key(session, slice))
    }
}
