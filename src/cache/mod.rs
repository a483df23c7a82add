//! Content-addressed caches shared by the scanner and the build pipeline.
//!
//! Entries are keyed by `(path, fingerprint)`: one slot per path, and a hit
//! is served only when the stored fingerprint equals the caller's. Entries
//! expire after a TTL even without capacity pressure, and the least recently
//! used entry is evicted once the capacity bound is reached.

mod store;

pub use store::{persist_cache, restore_cache};

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::utils::hash::Fingerprint;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub fingerprint: Fingerprint,
    pub value: V,
    pub expires_at: Instant,
    /// Monotonic marker; larger means more recently used.
    pub recency: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded LRU + TTL cache. The lock is held only for map operations.
pub struct ContentCache<V> {
    entries: Mutex<LruCache<PathBuf, CacheEntry<V>>>,
    ttl: Duration,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> ContentCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Value for `path` if it was stored under `fingerprint` and is still live.
    pub fn get(&self, path: &Path, fingerprint: Fingerprint) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let hit = match entries.peek(path).map(|e| (e.expires_at <= now, e.fingerprint)) {
            Some((true, _)) => {
                entries.pop(path);
                None
            }
            Some((false, stored)) if stored == fingerprint => {
                let recency = self.tick();
                entries.get_mut(path).map(|entry| {
                    entry.expires_at = now + self.ttl;
                    entry.recency = recency;
                    entry.value.clone()
                })
            }
            _ => None,
        };
        drop(entries);

        let counter = if hit.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Most recent live value for `path`, whatever its fingerprint.
    ///
    /// Used by lookups that validate freshness themselves (size + mtime).
    /// Does not touch hit/miss counters.
    pub fn latest(&self, path: &Path) -> Option<(Fingerprint, V)> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.peek(path)?.expires_at <= now {
            entries.pop(path);
            return None;
        }
        let recency = self.tick();
        let entry = entries.get_mut(path)?;
        entry.expires_at = now + self.ttl;
        entry.recency = recency;
        Some((entry.fingerprint, entry.value.clone()))
    }

    /// Store `value` for `(path, fingerprint)`, replacing any older fingerprint.
    pub fn insert(&self, path: PathBuf, fingerprint: Fingerprint, value: V) {
        let entry = CacheEntry {
            fingerprint,
            value,
            expires_at: Instant::now() + self.ttl,
            recency: self.tick(),
        };
        self.entries.lock().put(path, entry);
    }

    /// Store `update(current)` for `(path, fingerprint)`, where `current` is
    /// the live value already stored under that same fingerprint. Runs under
    /// the cache lock, so concurrent writers of one path never lose updates.
    pub fn upsert(
        &self,
        path: PathBuf,
        fingerprint: Fingerprint,
        update: impl FnOnce(Option<&V>) -> V,
    ) {
        let now = Instant::now();
        let recency = self.tick();
        let mut entries = self.entries.lock();
        let current = entries
            .peek(&path)
            .filter(|e| e.fingerprint == fingerprint && e.expires_at > now)
            .map(|e| &e.value);
        let value = update(current);
        entries.put(
            path,
            CacheEntry {
                fingerprint,
                value,
                expires_at: now + self.ttl,
                recency,
            },
        );
    }

    /// Edit the stored value for `path` in place. Returning `false` from
    /// `edit` drops the entry.
    pub fn edit(&self, path: &Path, edit: impl FnOnce(&mut V) -> bool) {
        let mut entries = self.entries.lock();
        let keep = match entries.peek_mut(path) {
            Some(entry) => edit(&mut entry.value),
            None => return,
        };
        if !keep {
            entries.pop(path);
        }
    }

    pub fn remove(&self, path: &Path) -> Option<V> {
        self.entries.lock().pop(path).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<PathBuf> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(p, _)| p.clone())
            .collect();
        for path in &expired {
            entries.pop(path);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Live entries, least recently used first.
    pub fn snapshot(&self) -> Vec<(PathBuf, CacheEntry<V>)> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut live: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        live.sort_by_key(|(_, e)| e.recency);
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::of(s)
    }

    #[test]
    fn test_hit_requires_matching_fingerprint() {
        let cache = ContentCache::new(8, Duration::from_secs(60));
        let path = PathBuf::from("/p/a.component");
        cache.insert(path.clone(), fp("v1"), 1);

        assert_eq!(cache.get(&path, fp("v1")), Some(1));
        assert_eq!(cache.get(&path, fp("v2")), None);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_insert_replaces_old_fingerprint() {
        let cache = ContentCache::new(8, Duration::from_secs(60));
        let path = PathBuf::from("/p/a.component");
        cache.insert(path.clone(), fp("v1"), 1);
        cache.insert(path.clone(), fp("v2"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&path, fp("v1")), None);
        assert_eq!(cache.get(&path, fp("v2")), Some(2));
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = ContentCache::new(2, Duration::from_secs(60));
        let a = PathBuf::from("/a");
        let b = PathBuf::from("/b");
        let c = PathBuf::from("/c");
        cache.insert(a.clone(), fp("a"), 'a');
        cache.insert(b.clone(), fp("b"), 'b');
        // touch a so b becomes least recently used
        assert!(cache.get(&a, fp("a")).is_some());
        cache.insert(c.clone(), fp("c"), 'c');

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&b, fp("b")).is_none());
        assert!(cache.get(&a, fp("a")).is_some());
        assert!(cache.get(&c, fp("c")).is_some());
    }

    #[test]
    fn test_ttl_expiry_without_pressure() {
        let cache = ContentCache::new(8, Duration::from_millis(30));
        let path = PathBuf::from("/p/a");
        cache.insert(path.clone(), fp("a"), 1);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&path, fp("a")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = ContentCache::new(8, Duration::from_millis(30));
        cache.insert(PathBuf::from("/a"), fp("a"), 1);
        cache.insert(PathBuf::from("/b"), fp("b"), 2);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_latest_ignores_fingerprint() {
        let cache = ContentCache::new(8, Duration::from_secs(60));
        let path = PathBuf::from("/p/a");
        cache.insert(path.clone(), fp("a"), "artifact");
        assert_eq!(cache.latest(&path), Some((fp("a"), "artifact")));
        assert_eq!(cache.stats().hits + cache.stats().misses, 0);
    }

    #[test]
    fn test_upsert_merges_only_same_fingerprint() {
        let cache = ContentCache::new(8, Duration::from_secs(60));
        let path = PathBuf::from("/p/a");
        let push = |fingerprint, item: &'static str| {
            cache.upsert(path.clone(), fingerprint, |current: Option<&Vec<&str>>| {
                let mut items = current.cloned().unwrap_or_default();
                items.push(item);
                items
            })
        };
        push(fp("v1"), "a");
        push(fp("v1"), "b");
        assert_eq!(cache.get(&path, fp("v1")), Some(vec!["a", "b"]));

        // new content starts over
        push(fp("v2"), "c");
        assert_eq!(cache.get(&path, fp("v2")), Some(vec!["c"]));
    }

    #[test]
    fn test_edit_can_drop_entry() {
        let cache = ContentCache::new(8, Duration::from_secs(60));
        let path = PathBuf::from("/p/a");
        cache.insert(path.clone(), fp("a"), 2);
        cache.edit(&path, |n| {
            *n -= 1;
            *n > 0
        });
        assert_eq!(cache.get(&path, fp("a")), Some(1));
        cache.edit(&path, |n| {
            *n -= 1;
            *n > 0
        });
        assert!(cache.is_empty());
        // absent path is a no-op
        cache.edit(&path, |_| panic!("no entry to edit"));
    }

    #[test]
    fn test_snapshot_orders_by_recency() {
        let cache = ContentCache::new(8, Duration::from_secs(60));
        cache.insert(PathBuf::from("/a"), fp("a"), 1);
        cache.insert(PathBuf::from("/b"), fp("b"), 2);
        cache.get(Path::new("/a"), fp("a"));
        let order: Vec<_> = cache.snapshot().into_iter().map(|(p, _)| p).collect();
        assert_eq!(order, vec![PathBuf::from("/b"), PathBuf::from("/a")]);
    }
}
