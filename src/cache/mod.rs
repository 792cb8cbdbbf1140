//! Multi-level cache: an in-process LRU tier over an optional SQLite tier.
//!
//! Reads cascade top-down and promote lower-tier hits; writes go through to
//! every enabled tier. Concurrent misses for one key coalesce so a loader
//! runs at most once.

mod memory;
mod sqlite;

use crate::error::GatewayError;
use crate::time::epoch_millis;
use memory::{Entry, Lookup, MemoryTier};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Item limit for the memory tier.
    pub max_items: usize,
    /// Approximate byte budget for the memory tier.
    pub max_bytes: usize,
    /// TTL applied when the caller does not pass one.
    pub default_ttl: Duration,
    /// Lower clamp for caller-supplied TTLs.
    pub min_ttl: Duration,
    /// Upper clamp for caller-supplied TTLs.
    pub max_ttl: Duration,
    /// File path of the durable tier; `None` runs memory-only.
    pub sqlite_path: Option<PathBuf>,
    /// How often the background sweeper removes expired entries.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_bytes: 100 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            min_ttl: Duration::from_secs(10),
            max_ttl: Duration::from_secs(3600),
            sqlite_path: None,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Hit/miss/set counters for one namespace.
#[derive(Debug, Default, Clone)]
pub struct NamespaceStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
}

/// Aggregate cache statistics.
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entry_count: usize,
    pub total_bytes: usize,
    pub file_items: u64,
    pub by_namespace: HashMap<String, NamespaceStats>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    deletes: u64,
    evictions: u64,
    expirations: u64,
    by_namespace: HashMap<String, NamespaceStats>,
}

struct Inner {
    memory: MemoryTier,
    counters: Counters,
}

type FlightResult = Result<Value, GatewayError>;

/// Multi-level cache with write-through, promotion, invalidation by key,
/// prefix, and tag, and request coalescing.
///
/// One mutex guards the memory tier, the tag index, and the counters. The
/// SQLite tier has its own lock and is never touched while the memory lock
/// is held.
pub struct TieredCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    file: Option<sqlite::SqliteTier>,
    pending: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
}

impl TieredCache {
    pub fn new(config: CacheConfig) -> Result<Self, GatewayError> {
        let file = match &config.sqlite_path {
            Some(path) => Some(sqlite::SqliteTier::open(path)?),
            None => None,
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                memory: MemoryTier::new(config.max_items, config.max_bytes),
                counters: Counters::default(),
            }),
            file,
            pending: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Derive the cache key for an HTTP request.
    ///
    /// The inputs are serialized to canonical JSON (keys sorted), hashed with
    /// SHA-256, and truncated to 32 lowercase hex characters, so semantically
    /// identical requests map to the same key regardless of argument order.
    pub fn request_key(
        method: &str,
        url: &str,
        params: &BTreeMap<String, String>,
        body: Option<&Value>,
    ) -> String {
        let canonical = serde_json::json!({
            "body": body,
            "method": method,
            "params": params,
            "url": url,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        hex[..32].to_string()
    }

    /// Get a value, checking the memory tier first and promoting file-tier
    /// hits into memory with the default TTL.
    pub fn get(&self, key: &str, namespace: &str) -> Option<Value> {
        let full_key = self.full_key(namespace, key);
        let now = epoch_millis();

        {
            let mut inner = self.lock();
            match inner.memory.get(&full_key, now) {
                Lookup::Hit(value) => {
                    record_hit(&mut inner.counters, namespace);
                    return Some(value);
                }
                Lookup::Expired => inner.counters.expirations += 1,
                Lookup::Miss => {}
            }
        }

        if let Some(file) = &self.file {
            if let Some(value) = file.get(&full_key, now as f64 / 1000.0) {
                let mut inner = self.lock();
                let evicted = inner.memory.insert(
                    full_key,
                    self.make_entry(value.clone(), self.config.default_ttl, &[], namespace, now),
                );
                inner.counters.evictions += evicted;
                record_hit(&mut inner.counters, namespace);
                return Some(value);
            }
        }

        let mut inner = self.lock();
        record_miss(&mut inner.counters, namespace);
        None
    }

    /// Write a value through to every enabled tier.
    ///
    /// The TTL is clamped into `[min_ttl, max_ttl]`; `None` uses the default.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        tags: &[String],
        namespace: &str,
    ) {
        let ttl = self.clamp_ttl(ttl);
        let full_key = self.full_key(namespace, key);
        let now = epoch_millis();
        let entry = self.make_entry(value, ttl, tags, namespace, now);
        let (created_secs, expires_secs) =
            (entry.created_at_ms as f64 / 1000.0, entry.expires_at_ms as f64 / 1000.0);
        let file_value = entry.value.clone();
        let tag_set = entry.tags.clone();

        {
            let mut inner = self.lock();
            let evicted = inner.memory.insert(full_key.clone(), entry);
            inner.counters.evictions += evicted;
            inner.counters.sets += 1;
            inner.counters.by_namespace.entry(namespace.to_string()).or_default().sets += 1;
        }

        if let Some(file) = &self.file {
            file.put(&full_key, &file_value, created_secs, expires_secs, namespace, &tag_set);
        }
    }

    /// Remove one key from every tier.
    pub fn delete(&self, key: &str, namespace: &str) -> bool {
        let full_key = self.full_key(namespace, key);
        let removed_memory = {
            let mut inner = self.lock();
            inner.memory.remove(&full_key).is_some()
        };
        let removed_file = self.file.as_ref().map(|f| f.delete(&full_key)).unwrap_or(false);

        let removed = removed_memory || removed_file;
        if removed {
            self.lock().counters.deletes += 1;
        }
        removed
    }

    /// Remove every key starting with `prefix` (applied to full, namespaced
    /// keys) from every tier. Returns how many entries were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> u64 {
        let mut count = {
            let mut inner = self.lock();
            let keys = inner.memory.keys_with_prefix(prefix);
            let mut removed = 0u64;
            for key in keys {
                if inner.memory.remove(&key).is_some() {
                    removed += 1;
                }
            }
            inner.counters.deletes += removed;
            removed
        };
        if let Some(file) = &self.file {
            count += file.delete_prefix(prefix);
        }
        count
    }

    /// Remove every key carrying `tag` from every tier.
    pub fn invalidate_tag(&self, tag: &str) -> u64 {
        let mut count = {
            let mut inner = self.lock();
            let keys = inner.memory.keys_with_tag(tag);
            let mut removed = 0u64;
            for key in keys {
                if inner.memory.remove(&key).is_some() {
                    removed += 1;
                }
            }
            inner.counters.deletes += removed;
            removed
        };
        if let Some(file) = &self.file {
            count += file.delete_tag(tag);
        }
        count
    }

    /// Drop everything from every tier.
    pub fn clear(&self) {
        self.lock().memory.clear();
        if let Some(file) = &self.file {
            file.clear();
        }
    }

    /// Get the cached value or run `loader` to produce it, coalescing
    /// concurrent misses on the same key: exactly one loader runs and every
    /// caller observes its result, including failures.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        namespace: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> FlightResult
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = FlightResult>,
    {
        if let Some(value) = self.get(key, namespace) {
            return Ok(value);
        }

        let full_key = self.full_key(namespace, key);
        let waiter = {
            let mut pending = self.lock_pending();
            match pending.get(&full_key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    pending.insert(full_key.clone(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(result) => result,
                // The leader was dropped before completing.
                Err(_) => Err(GatewayError::Transport {
                    kind: "coalesce".into(),
                    detail: "loader abandoned before completing".into(),
                }),
            };
        }

        // Leader path. The guard unregisters the flight if the loader is
        // cancelled, which closes the channel and wakes every waiter.
        let guard = FlightGuard { pending: &self.pending, key: full_key };
        let result = loader().await;
        if let Ok(value) = &result {
            self.set(key, value.clone(), ttl, &[], namespace);
        }
        if let Some(tx) = guard.disarm() {
            let _ = tx.send(result.clone());
        }
        result
    }

    /// Remove expired entries from every tier. Returns how many were removed.
    pub fn sweep(&self) -> u64 {
        let now = epoch_millis();
        let mut removed = {
            let mut inner = self.lock();
            let swept = inner.memory.sweep(now);
            inner.counters.expirations += swept;
            swept
        };
        if let Some(file) = &self.file {
            removed += file.sweep(now as f64 / 1000.0);
        }
        removed
    }

    /// Spawn the periodic expired-entry sweeper. The caller owns the handle
    /// and aborts it on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = cache.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "cache sweep removed expired entries");
                }
            }
        })
    }

    /// Snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.counters.hits,
            misses: inner.counters.misses,
            sets: inner.counters.sets,
            deletes: inner.counters.deletes,
            evictions: inner.counters.evictions,
            expirations: inner.counters.expirations,
            entry_count: inner.memory.len(),
            total_bytes: inner.memory.bytes(),
            file_items: self.file.as_ref().map(|f| f.len()).unwrap_or(0),
            by_namespace: inner.counters.by_namespace.clone(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn clamp_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.config.default_ttl)
            .clamp(self.config.min_ttl, self.config.max_ttl)
    }

    fn full_key(&self, namespace: &str, key: &str) -> String {
        if namespace == "default" {
            key.to_string()
        } else {
            format!("{namespace}:{key}")
        }
    }

    fn make_entry(
        &self,
        value: Value,
        ttl: Duration,
        tags: &[String],
        namespace: &str,
        now_ms: u64,
    ) -> Entry {
        let size_bytes = value.to_string().len();
        Entry {
            value,
            created_at_ms: now_ms,
            expires_at_ms: now_ms + ttl.as_millis() as u64,
            hits: 0,
            size_bytes,
            tags: tags.iter().cloned().collect::<HashSet<String>>(),
            namespace: namespace.to_string(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<FlightResult>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes an in-flight entry when the leader is dropped without completing.
struct FlightGuard<'a> {
    pending: &'a Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    key: String,
}

impl FlightGuard<'_> {
    fn disarm(self) -> Option<broadcast::Sender<FlightResult>> {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
        std::mem::forget(self);
        tx
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

fn record_hit(counters: &mut Counters, namespace: &str) {
    counters.hits += 1;
    counters.by_namespace.entry(namespace.to_string()).or_default().hits += 1;
}

fn record_miss(counters: &mut Counters, namespace: &str) {
    counters.misses += 1;
    counters.by_namespace.entry(namespace.to_string()).or_default().misses += 1;
}
