//! In-process cache tier: LRU ordering, TTL expiry, tag and prefix lookup.

use lru::LruCache;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

/// One cached entry with its metadata.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub value: Value,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub hits: u64,
    pub size_bytes: usize,
    pub tags: HashSet<String>,
    pub namespace: String,
}

pub(crate) enum Lookup {
    Hit(Value),
    Expired,
    Miss,
}

/// Tier 0: insertion-ordered map with MRU-at-tail reordering on hit.
///
/// Carries no lock of its own; the owning cache serializes access together
/// with the statistics and the reverse tag index.
pub(crate) struct MemoryTier {
    max_items: usize,
    max_bytes: usize,
    map: LruCache<String, Entry>,
    tags: HashMap<String, HashSet<String>>,
    current_bytes: usize,
}

impl MemoryTier {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        let cap = NonZeroUsize::new(max_items.max(1)).expect("cap is at least one");
        Self { max_items: max_items.max(1), max_bytes, map: LruCache::new(cap), tags: HashMap::new(), current_bytes: 0 }
    }

    /// Look a key up, promoting it to most-recently-used on a live hit and
    /// dropping it if its TTL has lapsed.
    pub fn get(&mut self, key: &str, now_ms: u64) -> Lookup {
        let expired = match self.map.get_mut(key) {
            None => return Lookup::Miss,
            Some(entry) => {
                if now_ms > entry.expires_at_ms {
                    true
                } else {
                    entry.hits += 1;
                    return Lookup::Hit(entry.value.clone());
                }
            }
        };
        debug_assert!(expired);
        self.remove(key);
        Lookup::Expired
    }

    /// Insert an entry, evicting from the LRU head until both the item limit
    /// and the byte budget hold. Returns the number of evictions.
    pub fn insert(&mut self, key: String, entry: Entry) -> u64 {
        if self.map.contains(&key) {
            self.remove(&key);
        }

        let mut evicted = 0;
        while !self.map.is_empty()
            && (self.map.len() >= self.max_items
                || self.current_bytes + entry.size_bytes > self.max_bytes)
        {
            if let Some((old_key, old_entry)) = self.map.pop_lru() {
                self.unindex(&old_key, &old_entry);
                evicted += 1;
            }
        }

        self.current_bytes += entry.size_bytes;
        for tag in &entry.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.map.put(key, entry);
        evicted
    }

    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.map.pop(key)?;
        self.unindex(key, &entry);
        Some(entry)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.map
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn keys_with_tag(&self, tag: &str) -> Vec<String> {
        self.tags.get(tag).map(|keys| keys.iter().cloned().collect()).unwrap_or_default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&mut self, now_ms: u64) -> u64 {
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|(_, e)| now_ms > e.expires_at_ms)
            .map(|(k, _)| k.clone())
            .collect();
        let count = expired.len() as u64;
        for key in expired {
            self.remove(&key);
        }
        count
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.tags.clear();
        self.current_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn bytes(&self) -> usize {
        self.current_bytes
    }

    fn unindex(&mut self, key: &str, entry: &Entry) {
        self.current_bytes = self.current_bytes.saturating_sub(entry.size_bytes);
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }
}
