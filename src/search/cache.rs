//! Embedding cache manager.
//!
//! Keeps the corpus snapshot used for ranking, persists it through a
//! [`CacheStorage`], and applies the TTL freshness policy. Snapshots are
//! handed out as `Arc<EmbeddingCache>` and replaced wholesale on refresh, so
//! a search ranking against one snapshot is never disturbed by a concurrent
//! refresh.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::corpus::CorpusSource;
use super::storage::CacheStorage;
use super::types::{now_millis, EmbeddingCache, EmbeddingEntry};
use crate::error::{Error, Result};

/// Storage key holding the serialized entries.
pub const CACHE_KEY_EMBEDDINGS: &str = "chat_embeddings_cache";

/// Storage key holding the last refresh time (epoch millis, decimal text).
pub const CACHE_KEY_LAST_UPDATED: &str = "chat_embeddings_last_updated";

/// Cache manager configuration.
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    /// Maximum age of a usable cache.
    pub ttl: Duration,
    /// Required vector dimensionality. `None` accepts whatever the first
    /// entry has.
    pub dimension: Option<usize>,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(crate::config::DEFAULT_CACHE_TTL_SECS),
            dimension: Some(super::EMBEDDING_DIM),
        }
    }
}

/// Owns the in-memory corpus snapshot and its persisted copy.
pub struct EmbeddingCacheManager {
    storage: Arc<dyn CacheStorage>,
    config: CacheManagerConfig,
    current: RwLock<Arc<EmbeddingCache>>,
    /// Serialises refreshes so an older fetch never overwrites a newer one.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl EmbeddingCacheManager {
    /// Create a manager with an empty in-memory cache.
    pub fn new(storage: Arc<dyn CacheStorage>, config: CacheManagerConfig) -> Self {
        Self {
            storage,
            config,
            current: RwLock::new(Arc::new(EmbeddingCache::empty())),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &CacheManagerConfig {
        &self.config
    }

    fn ttl_millis(&self) -> u64 {
        self.config.ttl.as_millis() as u64
    }

    /// Current in-memory snapshot. Never waits on I/O.
    pub fn get(&self) -> Arc<EmbeddingCache> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, cache: Arc<EmbeddingCache>) {
        metrics::gauge!("chatsearch_cache_entries").set(cache.len() as f64);
        match self.current.write() {
            Ok(mut guard) => *guard = cache,
            Err(poisoned) => *poisoned.into_inner() = cache,
        }
    }

    /// Load the persisted cache if it is younger than the TTL.
    ///
    /// Returns `None` on a miss: absent keys, an expired timestamp, or any
    /// storage or decoding failure. A hit also becomes the in-memory
    /// snapshot.
    pub async fn load(&self) -> Option<Arc<EmbeddingCache>> {
        let cache = self.read_persisted().await?;
        if !cache.is_fresh(now_millis(), self.ttl_millis()) {
            debug!("Persisted embedding cache expired");
            return None;
        }

        info!("Using persisted embedding cache ({} entries)", cache.len());
        let cache = Arc::new(cache);
        self.replace(cache.clone());
        Some(cache)
    }

    /// Read the persisted cache regardless of age.
    async fn read_persisted(&self) -> Option<EmbeddingCache> {
        let entries_raw = match self.storage.get(CACHE_KEY_EMBEDDINGS).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No persisted embedding cache");
                return None;
            }
            Err(e) => {
                warn!("Failed to read persisted embedding cache: {}", e);
                return None;
            }
        };
        let timestamp_raw = match self.storage.get(CACHE_KEY_LAST_UPDATED).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("Persisted embedding cache has no timestamp");
                return None;
            }
            Err(e) => {
                warn!("Failed to read persisted cache timestamp: {}", e);
                return None;
            }
        };

        let last_refreshed = match std::str::from_utf8(&timestamp_raw)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            Some(ts) => ts,
            None => {
                warn!("Persisted cache timestamp is not a valid integer");
                return None;
            }
        };
        let entries: Vec<EmbeddingEntry> = match bincode::deserialize(&entries_raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to decode persisted embedding cache: {}", e);
                return None;
            }
        };

        match EmbeddingCache::new(entries, last_refreshed, self.config.dimension) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("Persisted embedding cache is inconsistent: {}", e);
                None
            }
        }
    }

    /// Replace the cache with a fresh corpus from `source`.
    ///
    /// The new entries and timestamp are persisted in one batch before the
    /// in-memory snapshot is swapped. Any failure leaves the previous cache,
    /// both in memory and in storage, untouched.
    pub async fn refresh(&self, source: &dyn CorpusSource) -> Result<Arc<EmbeddingCache>> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_recorded(source).await
    }

    /// Refresh unless another caller refreshed while this one waited for
    /// the lock.
    async fn refresh_if_stale(&self, source: &dyn CorpusSource) -> Result<Arc<EmbeddingCache>> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.get();
        if current.is_fresh(now_millis(), self.ttl_millis()) {
            debug!("Embedding cache refreshed by a concurrent caller");
            return Ok(current);
        }
        self.refresh_recorded(source).await
    }

    async fn refresh_recorded(&self, source: &dyn CorpusSource) -> Result<Arc<EmbeddingCache>> {
        let result = self.refresh_locked(source).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("chatsearch_cache_refresh_total", "outcome" => outcome).increment(1);
        result
    }

    async fn refresh_locked(&self, source: &dyn CorpusSource) -> Result<Arc<EmbeddingCache>> {
        info!("Refreshing embedding cache");
        let entries = source.fetch_all().await?;

        let refreshed_at = now_millis();
        let cache = EmbeddingCache::new(entries, refreshed_at, self.config.dimension)?;

        let encoded = bincode::serialize(&cache.entries)?;
        self.storage
            .write_batch(vec![
                (CACHE_KEY_EMBEDDINGS.to_string(), encoded),
                (
                    CACHE_KEY_LAST_UPDATED.to_string(),
                    refreshed_at.to_string().into_bytes(),
                ),
            ])
            .await?;

        let cache = Arc::new(cache);
        self.replace(cache.clone());
        info!("Embedding cache refreshed ({} entries)", cache.len());
        Ok(cache)
    }

    /// Make sure a usable cache is available, preferring fresh data.
    ///
    /// Order: fresh in-memory snapshot, fresh persisted cache, refresh. When
    /// the refresh fails the last known cache is served stale (in-memory
    /// first, then persisted). Only when no cache ever existed does this
    /// fail, with [`Error::CacheUnavailable`]. A corpus whose vectors
    /// disagree on dimensionality is reported as
    /// [`Error::DimensionMismatch`] and never served stale.
    ///
    /// Concurrent callers on a cold or stale cache share one corpus fetch.
    pub async fn ensure(&self, source: &dyn CorpusSource) -> Result<Arc<EmbeddingCache>> {
        let current = self.get();
        if current.is_fresh(now_millis(), self.ttl_millis()) {
            return Ok(current);
        }

        if let Some(loaded) = self.load().await {
            return Ok(loaded);
        }

        debug!("Embedding cache miss, refreshing");
        let err = match self.refresh_if_stale(source).await {
            Ok(cache) => return Ok(cache),
            Err(e @ Error::DimensionMismatch { .. }) => return Err(e),
            Err(e) => e,
        };

        let current = self.get();
        if current.is_populated() {
            warn!("Cache refresh failed, serving stale in-memory cache: {}", err);
            return Ok(current);
        }
        if let Some(stale) = self.read_persisted().await {
            warn!("Cache refresh failed, serving stale persisted cache: {}", err);
            let stale = Arc::new(stale);
            self.replace(stale.clone());
            return Ok(stale);
        }

        Err(Error::CacheUnavailable(err.to_string()))
    }
}
