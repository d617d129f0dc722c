//! Result cache for repeated read queries.
//!
//! Sits in front of signal lists and analytics so identical logical queries
//! within the TTL are served without touching the store. Keys are derived
//! deterministically from the query shape. The backend is pluggable; any
//! backend failure fails open and is reported as a miss.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Default TTL for list/analytics queries.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Key/value store with per-entry TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Drop every expired entry and return how many went. Backends that
    /// expire on their own can keep the default.
    async fn evict_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// In-process backend. Expired entries are dropped on read or by
/// [`CacheBackend::evict_expired`].
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok(before - entries.len())
    }
}

// ---------------------------------------------------------------------------
// Cache front
// ---------------------------------------------------------------------------

/// Whether a value came from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    /// Value for the `X-Cache` response header.
    pub fn as_header(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// A value plus where it came from.
#[derive(Debug, Clone)]
pub struct Cached<T> {
    pub value: T,
    pub status: CacheStatus,
}

pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn CacheBackend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// In-memory cache with the default TTL.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryCacheBackend::new()),
            Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        )
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Deterministic key: scope plus the JSON form of the query.
    ///
    /// Structs serialize their fields in declaration order, so equal
    /// queries always produce equal keys.
    pub fn key<Q: Serialize>(scope: &str, query: &Q) -> String {
        match serde_json::to_string(query) {
            Ok(json) => format!("{scope}:{json}"),
            Err(_) => format!("{scope}:?"),
        }
    }

    /// Look up a value. Backend errors and undecodable entries are misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "Cache backend read failed, treating as miss");
                None
            }
        };

        let value = raw.and_then(|json| match serde_json::from_str(&json) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "Cached value undecodable, treating as miss");
                None
            }
        });

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache miss");
        }
        value
    }

    /// Store a value. Failures are logged and swallowed.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "Value not serializable, skipping cache");
                return;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);
        if let Err(e) = self.backend.set(key, json, ttl).await {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(key, error = %e, "Cache backend write failed");
        }
    }

    /// Serve from cache or compute, store and return.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(Cached {
                value,
                status: CacheStatus::Hit,
            });
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(Cached {
            value,
            status: CacheStatus::Miss,
        })
    }

    /// Sweep expired entries out of the backend. Keys that are never read
    /// again are only reclaimed here.
    pub async fn evict_expired(&self) -> usize {
        match self.backend.evict_expired().await {
            Ok(evicted) => {
                debug!(evicted, "Cache sweep finished");
                evicted
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Cache sweep failed");
                0
            }
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
