//! Two-layer token cache: an in-memory map in front of an optional persistent key-value store.

use crate::error::{AuthError, Result};
use crate::token::{TokenInfo, TokenKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The narrow persistence contract the token cache depends on.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Store `value`; `ttl = None` keeps it until deleted.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

/// Process-local [`KvStore`] with per-entry TTL. Expired entries are dropped lazily.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, KvEntry>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut map = self.entries.write();
        match map.get(key) {
            Some(e) if e.is_live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .write()
            .insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .read()
            .get(key)
            .is_some_and(|e| e.is_live(now)))
    }
}

/// Token cache keyed by (tenant, service).
///
/// A single reader/writer lock guards the in-memory map; it is never held across an `.await`.
/// Writes are last-writer-wins.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<TokenStoreInner>,
}

struct TokenStoreInner {
    memory: RwLock<HashMap<TokenKey, TokenInfo>>,
    persistent: Option<Arc<dyn KvStore>>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl TokenStore {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(TokenStoreInner {
                memory: RwLock::new(HashMap::new()),
                persistent: None,
            }),
        }
    }

    #[must_use]
    pub fn with_persistent(store: Arc<dyn KvStore>) -> Self {
        Self {
            inner: Arc::new(TokenStoreInner {
                memory: RwLock::new(HashMap::new()),
                persistent: Some(store),
            }),
        }
    }

    /// In-memory lookup only.
    #[must_use]
    pub fn cached(&self, key: &TokenKey) -> Option<TokenInfo> {
        self.inner.memory.read().get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.memory.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory first, then the persistent layer (which repopulates memory on a hit).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the persistent layer fails.
    pub async fn get(&self, key: &TokenKey) -> Result<Option<TokenInfo>> {
        if let Some(t) = self.cached(key) {
            return Ok(Some(t));
        }
        let Some(persistent) = &self.inner.persistent else {
            return Ok(None);
        };

        let storage_key = key.storage_key();
        let Some(bytes) = persistent.get(&storage_key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<TokenInfo>(&bytes) {
            Ok(token) => {
                debug!(key = %key, "token loaded from persistent store");
                self.inner
                    .memory
                    .write()
                    .insert(key.clone(), token.clone());
                Ok(Some(token))
            }
            Err(e) => {
                warn!(key = %key, error = %e, "dropping unreadable persisted token");
                persistent.delete(&storage_key).await?;
                Ok(None)
            }
        }
    }

    /// Write-through to both layers.
    ///
    /// Tokens carrying a refresh token are persisted without TTL so they can still be refreshed
    /// after the access token lapses; others expire from the persistent layer with the token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if serialization or the persistent layer fails.
    pub async fn put(&self, key: &TokenKey, token: TokenInfo) -> Result<()> {
        let persisted = match &self.inner.persistent {
            Some(_) => Some(
                serde_json::to_vec(&token)
                    .map_err(|e| AuthError::Store(format!("serialize token: {e}")))?,
            ),
            None => None,
        };
        let ttl = if token.refresh_token.is_some() {
            None
        } else {
            token.time_to_expiry()
        };

        self.inner.memory.write().insert(key.clone(), token);

        if let (Some(persistent), Some(bytes)) = (&self.inner.persistent, persisted) {
            if ttl.is_some_and(|d| d.is_zero()) {
                persistent.delete(&key.storage_key()).await?;
            } else {
                persistent.set(&key.storage_key(), bytes, ttl).await?;
            }
        }
        Ok(())
    }

    /// Evict from both layers.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the persistent layer fails.
    pub async fn remove(&self, key: &TokenKey) -> Result<()> {
        self.inner.memory.write().remove(key);
        if let Some(persistent) = &self.inner.persistent {
            persistent.delete(&key.storage_key()).await?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`AuthError::Store`] if the persistent layer fails.
    pub async fn clear(&self) -> Result<()> {
        self.inner.memory.write().clear();
        if let Some(persistent) = &self.inner.persistent {
            persistent.clear().await?;
        }
        Ok(())
    }
}
