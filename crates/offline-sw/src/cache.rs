//! Cache generations and the repository that holds them.
//!
//! [`CacheStorage`] and [`Cache`] are the seams the cache manager is written
//! against; [`MemoryCacheStorage`] is the in-process implementation.

use async_trait::async_trait;
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::request::{RequestKey, Response};
use crate::ServiceWorkerError;

/// One named cache generation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Generation name.
    fn name(&self) -> &str;

    /// Look up a stored response.
    async fn match_request(&self, key: &RequestKey)
        -> Result<Option<Response>, ServiceWorkerError>;

    /// Store a response, replacing any previous entry for the key.
    async fn put(&self, key: RequestKey, response: Response) -> Result<(), ServiceWorkerError>;

    /// Store a batch of responses; either every entry is written or none is.
    async fn put_all(&self, entries: Vec<(RequestKey, Response)>)
        -> Result<(), ServiceWorkerError>;

    /// Remove an entry.
    async fn delete(&self, key: &RequestKey) -> Result<bool, ServiceWorkerError>;

    /// All stored request keys.
    async fn keys(&self) -> Result<Vec<RequestKey>, ServiceWorkerError>;

    /// Number of stored entries.
    async fn len(&self) -> Result<usize, ServiceWorkerError> {
        Ok(self.keys().await?.len())
    }
}

/// Repository of named cache generations.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a generation, creating it if it does not exist.
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError>;

    /// Open a generation only if it exists.
    async fn open_existing(&self, name: &str)
        -> Result<Option<Arc<dyn Cache>>, ServiceWorkerError>;

    /// Check if a generation exists.
    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Delete a generation. Deleting a missing generation is a no-op.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Names of all generations, oldest first.
    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError>;
}

// ==================== Memory Cache ====================

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: Response,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn new(response: Response) -> Self {
        Self {
            response,
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }
}

/// In-memory cache generation. Concurrent writes to one key are last-write-wins.
#[derive(Debug)]
pub struct MemoryCache {
    name: String,
    entries: RwLock<HashMap<RequestKey, CacheEntry>>,
}

impl MemoryCache {
    /// Create an empty generation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Get the full entry, including its timestamp.
    pub async fn entry(&self, key: &RequestKey) -> Option<CacheEntry> {
        self.entries.read().await.get(key).cloned()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(
        &self,
        key: &RequestKey,
    ) -> Result<Option<Response>, ServiceWorkerError> {
        let hit = self
            .entries
            .read()
            .await
            .get(key)
            .map(|entry| entry.response.clone());
        trace!(cache = %self.name, key = %key, hit = hit.is_some(), "Cache lookup");
        Ok(hit)
    }

    async fn put(&self, key: RequestKey, response: Response) -> Result<(), ServiceWorkerError> {
        trace!(cache = %self.name, key = %key, "Cache put");
        self.entries
            .write()
            .await
            .insert(key, CacheEntry::new(response));
        Ok(())
    }

    async fn put_all(
        &self,
        entries: Vec<(RequestKey, Response)>,
    ) -> Result<(), ServiceWorkerError> {
        let mut map = self.entries.write().await;
        for (key, response) in entries {
            map.insert(key, CacheEntry::new(response));
        }
        Ok(())
    }

    async fn delete(&self, key: &RequestKey) -> Result<bool, ServiceWorkerError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, ServiceWorkerError> {
        let mut keys: Vec<RequestKey> = self.entries.read().await.keys().cloned().collect();
        keys.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(keys)
    }
}

// ==================== Memory Cache Storage ====================

#[derive(Debug, Default)]
struct StorageInner {
    caches: HashMap<String, Arc<MemoryCache>>,
    order: Vec<String>,
}

/// In-memory cache storage (the `caches` global).
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    inner: RwLock<StorageInner>,
}

impl MemoryCacheStorage {
    /// Create empty cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a generation with its concrete type, without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<MemoryCache>> {
        self.inner.read().await.caches.get(name).cloned()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, ServiceWorkerError> {
        let mut inner = self.inner.write().await;
        if let Some(cache) = inner.caches.get(name) {
            let cache: Arc<dyn Cache> = cache.clone();
            return Ok(cache);
        }

        debug!(cache = %name, "Creating cache generation");
        let cache = Arc::new(MemoryCache::new(name));
        inner.caches.insert(name.to_string(), cache.clone());
        inner.order.push(name.to_string());
        let cache: Arc<dyn Cache> = cache;
        Ok(cache)
    }

    async fn open_existing(
        &self,
        name: &str,
    ) -> Result<Option<Arc<dyn Cache>>, ServiceWorkerError> {
        let inner = self.inner.read().await;
        Ok(inner.caches.get(name).map(|cache| {
            let cache: Arc<dyn Cache> = cache.clone();
            cache
        }))
    }

    async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.inner.read().await.caches.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut inner = self.inner.write().await;
        let removed = inner.caches.remove(name).is_some();
        if removed {
            inner.order.retain(|n| n != name);
            debug!(cache = %name, "Deleted cache generation");
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
        Ok(self.inner.read().await.order.clone())
    }
}
