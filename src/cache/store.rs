//! Cache store protocol and the in-process backend.
//!
//! The engine only ever talks to a [`StoreHandle`], which bounds every call
//! with a timeout and turns failures into misses or skipped writes.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use tracing::warn;

use super::error::CacheError;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_STORE_ERROR: &str = "pagecache_store_error_total";

/// Per-write options passed through to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFlags {
    /// Ask the transport to compress the value.
    pub compressed: bool,
}

impl StoreFlags {
    pub const COMPRESSED: Self = Self { compressed: true };

    /// Client flag word as understood by memcached clients.
    pub fn bits(self) -> u32 {
        if self.compressed { 2 } else { 0 }
    }
}

/// A shared, non-transactional key-value store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    /// Store `value` under `key`. A zero `ttl` means no expiry.
    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        flags: StoreFlags,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Every live key, or `None` when the backend cannot enumerate.
    async fn keys(&self) -> Result<Option<Vec<String>>, CacheError>;

    /// Drop every entry.
    async fn flush_all(&self) -> Result<(), CacheError>;
}

struct MemoryEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process LRU store with per-entry TTL.
pub struct MemoryStore {
    entries: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => true,
            Some(entry) => return Ok(Some(entry.value.clone())),
            None => return Ok(None),
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
        _flags: StoreFlags,
    ) -> Result<(), CacheError> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        mutex_lock(&self.entries, SOURCE, "set")
            .put(key.to_string(), MemoryEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(mutex_lock(&self.entries, SOURCE, "delete")
            .pop(key)
            .is_some())
    }

    async fn keys(&self) -> Result<Option<Vec<String>>, CacheError> {
        let now = Instant::now();
        let entries = mutex_lock(&self.entries, SOURCE, "keys");
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(Some(keys))
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        mutex_lock(&self.entries, SOURCE, "flush_all").clear();
        Ok(())
    }
}

/// Timeout-bounded, failure-absorbing view of a [`CacheStore`].
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn CacheStore>,
    timeout: Duration,
}

impl StoreHandle {
    pub fn new(inner: Arc<dyn CacheStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn backend(&self) -> &Arc<dyn CacheStore> {
        &self.inner
    }

    /// Fetch `key`; errors and timeouts read as absent.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        match tokio::time::timeout(self.timeout, self.inner.get(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => {
                report_failure("get", key, &err);
                None
            }
            Err(_) => {
                report_failure("get", key, &CacheError::StoreTimeout { op: "get" });
                None
            }
        }
    }

    /// Store `value`; returns whether the write was acknowledged.
    pub async fn set(&self, key: &str, value: Bytes, ttl: Duration, flags: StoreFlags) -> bool {
        match tokio::time::timeout(self.timeout, self.inner.set(key, value, ttl, flags)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                report_failure("set", key, &err);
                false
            }
            Err(_) => {
                report_failure("set", key, &CacheError::StoreTimeout { op: "set" });
                false
            }
        }
    }
}

fn report_failure(op: &'static str, key: &str, err: &CacheError) {
    counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
    warn!(op, key, error = %err, "cache store call failed; continuing without it");
}
