//! Bounded key→bytes store with size-based admission and LRU eviction.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tracing::debug;

use super::lru::LruTracker;

/// In-memory cache of object bodies served on cache hits.
///
/// Admission is size-based: entries above the per-entry cap are never
/// admitted, and the least recently used entries are evicted until the total
/// fits under the byte ceiling. All operations take `&self`; callers on any
/// task may share one instance.
pub struct MemoryCache {
    max_total_bytes: u64,
    max_entry_bytes: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Bytes>,
    order: LruTracker,
    total_bytes: u64,
}

impl MemoryCache {
    pub fn new(max_total_bytes: u64, max_entry_bytes: u64) -> Self {
        Self {
            max_total_bytes,
            max_entry_bytes,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `key` is resident. Updates recency when it is.
    pub fn contains(&self, key: &str) -> bool {
        let mut inner = self.lock();
        if inner.entries.contains_key(key) {
            inner.order.touch(key);
            true
        } else {
            false
        }
    }

    /// The cached body for `key`, if resident. Updates recency.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.lock();
        let bytes = inner.entries.get(key).cloned()?;
        inner.order.touch(key);
        Some(bytes)
    }

    /// Admit `bytes` under `key` when the caps allow it; rejections are
    /// silent. An existing entry for the same key is replaced.
    pub fn maybe_add(&self, key: &str, bytes: Bytes) {
        let size = bytes.len() as u64;
        if size > self.max_entry_bytes || size > self.max_total_bytes {
            return;
        }

        let mut inner = self.lock();
        if let Some(old) = inner.entries.remove(key) {
            inner.total_bytes -= old.len() as u64;
            inner.order.forget(key);
        }
        while inner.total_bytes + size > self.max_total_bytes {
            let Some(victim) = inner.order.pop_oldest() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.total_bytes -= evicted.len() as u64;
                debug!(key = %victim, size = evicted.len(), "evicted cache entry");
            }
        }
        inner.total_bytes += size;
        inner.entries.insert(key.to_owned(), bytes);
        inner.order.touch(key);
    }

    /// Remove `key` if resident; idempotent.
    pub fn delete(&self, key: &str) {
        let mut inner = self.lock();
        if let Some(old) = inner.entries.remove(key) {
            inner.total_bytes -= old.len() as u64;
            inner.order.forget(key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_returns_same_bytes() {
        let cache = MemoryCache::new(1024, 256);
        cache.maybe_add("k", Bytes::from_static(b"HELLO"));
        assert_eq!(cache.get("k"), Some(Bytes::from_static(b"HELLO")));
        assert_eq!(cache.total_bytes(), 5);
    }

    #[test]
    fn entry_above_per_entry_cap_is_rejected() {
        let cache = MemoryCache::new(1024, 4);
        cache.maybe_add("k", Bytes::from_static(b"HELLO"));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn entry_exceeding_total_alone_is_rejected() {
        let cache = MemoryCache::new(4, 100);
        cache.maybe_add("k", Bytes::from_static(b"HELLO"));
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_frees_least_recently_used_first() {
        let cache = MemoryCache::new(10, 10);
        cache.maybe_add("a", Bytes::from_static(b"aaaa"));
        cache.maybe_add("b", Bytes::from_static(b"bbbb"));
        // Touch "a" so "b" becomes the eviction victim.
        assert!(cache.contains("a"));
        cache.maybe_add("c", Bytes::from_static(b"cccc"));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert!(cache.total_bytes() <= 10);
    }

    #[test]
    fn replacing_a_key_adjusts_total() {
        let cache = MemoryCache::new(1024, 256);
        cache.maybe_add("k", Bytes::from_static(b"aaaa"));
        cache.maybe_add("k", Bytes::from_static(b"bb"));
        assert_eq!(cache.total_bytes(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let cache = MemoryCache::new(1024, 256);
        cache.maybe_add("k", Bytes::from_static(b"v"));
        cache.delete("k");
        cache.delete("k");
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }
}
