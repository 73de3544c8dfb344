// Query Result Cache Service
//
// Caches query results under a request fingerprint with a fixed TTL and LRU
// eviction once the cache is full. Lookups never return an entry whose age
// has reached the TTL.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::CellValue;
use crate::services::clock::{system_clock, Clock};
use crate::services::database::adapter::QueryResult;

/// Cached query result with metadata
#[derive(Debug, Clone)]
struct CachedResult {
    /// Query result data
    result: QueryResult,
    /// Time when cached
    cached_at: Instant,
    /// Access tick of the last hit or insert, for LRU ordering
    last_access: u64,
    /// Number of times this cache entry was hit
    hit_count: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Total expirations
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CachedResult>,
    stats: CacheStats,
    tick: u64,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Query result cache with LRU eviction and TTL
///
/// Features:
/// - Fingerprint keys that are stable across processes
/// - TTL-based expiration, fixed per cache instance
/// - LRU eviction when cache is full
/// - Cache statistics (hit/miss ratio)
pub struct QueryResultCache {
    inner: Mutex<CacheInner>,
    /// Maximum number of entries
    max_size: usize,
    /// TTL applied to every entry
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl QueryResultCache {
    /// Create a new query cache
    ///
    /// # Arguments
    ///
    /// * `max_size` - Maximum number of cached entries (default: 1000)
    /// * `ttl_secs` - TTL in seconds (default: 300 = 5 minutes)
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self::with_clock(max_size, Duration::from_secs(ttl_secs), system_clock())
    }

    pub fn with_clock(max_size: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_size: max_size.max(1),
            ttl,
            clock,
        }
    }

    /// Fingerprint a query and its ordered parameters.
    ///
    /// SHA-256 over the query text (surrounding whitespace and trailing
    /// semicolons removed) followed by the type-tagged encoding of each
    /// parameter. No salt, so the same request hashes the same everywhere.
    pub fn fingerprint(query: &str, params: &[CellValue]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::normalize_query(query).as_bytes());
        hasher.update([0u8]);
        for param in params {
            hasher.update(param.canonical().as_bytes());
            hasher.update([0x1fu8]);
        }
        format!("{:x}", hasher.finalize())
    }

    fn normalize_query(query: &str) -> &str {
        query.trim().trim_end_matches(';').trim_end()
    }

    /// Get cached result if available and not expired
    ///
    /// Returns None if cache miss or expired; expired entries are removed.
    pub fn get(&self, fingerprint: &str) -> Option<QueryResult> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let tick = inner.next_tick();

        let expired = match inner.entries.get_mut(fingerprint) {
            Some(cached) if now.saturating_duration_since(cached.cached_at) < self.ttl => {
                cached.hit_count += 1;
                cached.last_access = tick;
                let hit_count = cached.hit_count;
                let result = cached.result.clone();
                inner.stats.hits += 1;
                tracing::debug!("Cache hit for key: {} (hit_count: {})", fingerprint, hit_count);
                return Some(result);
            }
            Some(_) => true,
            None => false,
        };

        inner.stats.misses += 1;
        if expired {
            inner.entries.remove(fingerprint);
            inner.stats.expirations += 1;
            tracing::debug!("Cache expired for key: {}", fingerprint);
        } else {
            tracing::debug!("Cache miss for key: {}", fingerprint);
        }
        None
    }

    /// Store query result in cache, replacing any previous entry
    pub fn put(&self, fingerprint: String, result: QueryResult) {
        let now = self.clock.now();
        let mut inner = self.lock();

        if inner.entries.len() >= self.max_size && !inner.entries.contains_key(&fingerprint) {
            Self::evict_lru(&mut inner);
        }

        let tick = inner.next_tick();
        inner.entries.insert(
            fingerprint.clone(),
            CachedResult {
                result,
                cached_at: now,
                last_access: tick,
                hit_count: 0,
            },
        );

        tracing::debug!(
            "Cached result for key: {} (cache size: {})",
            fingerprint,
            inner.entries.len()
        );
    }

    /// Evict least recently used entry
    fn evict_lru(inner: &mut CacheInner) {
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, cached)| cached.last_access)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
            tracing::debug!("Evicted cache entry: {}", key);
        }
    }

    /// Drop a single entry
    pub fn invalidate(&self, fingerprint: &str) -> bool {
        let removed = self.lock().entries.remove(fingerprint).is_some();
        if removed {
            tracing::debug!("Invalidated cache entry: {}", fingerprint);
        }
        removed
    }

    /// Clear all cache entries
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.clear();

        tracing::info!("Cleared {} cache entries", count);
        count
    }

    /// Remove expired entries
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut inner = self.lock();

        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, cached| now.saturating_duration_since(cached.cached_at) < ttl);
        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;

        if removed > 0 {
            tracing::info!("Cleaned up {} expired cache entries", removed);
        }
        removed
    }

    /// Get cache statistics
    pub fn get_stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    /// Get current cache size
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
