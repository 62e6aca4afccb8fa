//! Bounded in-memory cache with LRU eviction and TTL expiry
//!
//! Used for folder path resolution, directory listings and memoized
//! analysis results. Each instance carries its own name, capacity and TTL
//! and is guarded by a single mutex, so every operation is linearized.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::services::analysis::GroupingResult;
use crate::services::storage::FileNode;

/// Construction parameters for a [`BoundedCache`]
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub name: String,
    pub capacity: usize,
    pub ttl: Duration,
}

/// A cached entry with its insertion time
#[derive(Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > ttl
    }
}

/// Snapshot of a cache's size and limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub size: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
}

/// Thread-safe LRU cache with per-entry time-to-live
pub struct BoundedCache<K: Hash + Eq, V> {
    name: String,
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    /// Create a cache. A zero capacity is treated as one.
    pub fn new(name: impl Into<String>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.into(),
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.name.clone(), config.capacity, config.ttl)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get a value if present and not expired. A hit becomes most-recently-used;
    /// an expired entry is removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(self.ttl, now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
            debug!(cache = %self.name, "Evicted expired entry on access");
        }
        None
    }

    /// Insert or overwrite a value. Overwriting refreshes the timestamp and
    /// promotes the entry; a new key beyond capacity evicts the LRU entry.
    pub fn put(&self, key: K, value: V) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };
        let mut entries = self.entries.lock();
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                debug!(cache = %self.name, "Evicted least-recently-used entry");
            }
        }
    }

    /// Return the cached value or compute, store and return a new one.
    /// The whole operation runs under the cache mutex, so concurrent callers
    /// for the same key observe a single computed value.
    pub fn get_or_insert_with<F>(&self, key: K, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if let Some(entry) = entries.get(&key) {
            if !entry.is_expired(self.ttl, now) {
                return entry.value.clone();
            }
        }
        let value = compute();
        entries.put(
            key,
            CacheEntry {
                value: value.clone(),
                inserted_at: now,
            },
        );
        value
    }

    pub fn delete(&self, key: &K) {
        self.entries.lock().pop(key);
    }

    /// Remove every entry whose key matches the predicate; returns the count
    pub fn delete_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let mut entries = self.entries.lock();
        let doomed: Vec<K> = entries
            .iter()
            .filter(|(k, _)| predicate(k))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Scan all entries once and drop the expired ones
    pub fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(self.ttl, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            debug!(cache = %self.name, removed = expired.len(), "Removed expired entries");
        }
        expired.len()
    }

    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            name: self.name.clone(),
            size: entries.len(),
            capacity: entries.cap().get(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

/// Folder id -> full folder path
pub type PathCache = BoundedCache<String, String>;

/// Folder id -> one complete directory listing
pub type ListingCache = BoundedCache<String, Arc<Vec<FileNode>>>;

/// Folder id -> memoized grouping result
pub type AnalysisCache = BoundedCache<String, GroupingResult>;

/// The process-wide named caches
pub struct CacheRegistry {
    pub paths: Arc<PathCache>,
    pub listings: Arc<ListingCache>,
    pub analysis: Arc<AnalysisCache>,
}

impl CacheRegistry {
    pub fn new(path: &CacheConfig, listing: &CacheConfig, analysis: &CacheConfig) -> Self {
        Self {
            paths: Arc::new(BoundedCache::from_config(path)),
            listings: Arc::new(BoundedCache::from_config(listing)),
            analysis: Arc::new(BoundedCache::from_config(analysis)),
        }
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![self.paths.stats(), self.listings.stats(), self.analysis.stats()]
    }

    /// Clear one cache by name; false if no cache has that name
    pub fn clear(&self, name: &str) -> bool {
        if name == self.paths.name() {
            self.paths.clear();
        } else if name == self.listings.name() {
            self.listings.clear();
        } else if name == self.analysis.name() {
            self.analysis.clear();
        } else {
            return false;
        }
        debug!(cache = %name, "Cache cleared");
        true
    }

    pub fn clear_all(&self) {
        self.paths.clear();
        self.listings.clear();
        self.analysis.clear();
    }

    /// Drop everything cached about one folder. The folder's own path entry
    /// is kept unless the folder was renamed or moved; callers that did so
    /// should also call [`invalidate_path`](Self::invalidate_path).
    pub fn invalidate_folder(&self, folder_id: &str) {
        self.listings.delete(&folder_id.to_string());
        self.analysis.delete(&folder_id.to_string());
    }

    pub fn invalidate_path(&self, folder_id: &str) {
        self.paths.delete(&folder_id.to_string());
    }

    pub fn cleanup_expired(&self) -> usize {
        self.paths.cleanup_expired()
            + self.listings.cleanup_expired()
            + self.analysis.cleanup_expired()
    }
}
