//! Result cache for reads.
//!
//! An in-process key/value store of recent read results. Capacity is a fixed
//! entry count; inserting beyond it evicts one entry chosen by the configured
//! policy before the new entry is admitted.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use polyweave_common::CrudOperation;

/// Rule for choosing the entry to evict when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used.
    #[default]
    Lru,
    /// Least frequently used; ties go to the least recently used.
    Lfu,
    /// Oldest insertion.
    Fifo,
    /// Soonest expiry; entries without a TTL go last.
    Ttl,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    /// Filter the value was read with.
    pub filter: Option<Value>,
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub expires_at: Option<Instant>,
    pub hits: u64,
    /// Approximate serialized size in bytes.
    pub size: usize,
    inserted_seq: u64,
    access_seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// Entries rewritten by a speculative change, with the values they held
/// before it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRevert {
    prefix: String,
    /// Invalidation generation of the prefix when the change was made.
    generation: u64,
    changes: Vec<RevertedEntry>,
}

#[derive(Debug, Clone, PartialEq)]
struct RevertedEntry {
    key: String,
    original: Value,
    speculative: Value,
}

impl CacheRevert {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of entries the change touched.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub default_ttl: Option<Duration>,
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Some(Duration::from_secs(60)),
            policy: EvictionPolicy::Lru,
        }
    }
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    /// Bumped by every prefix invalidation.
    generations: HashMap<String, u64>,
    seq: u64,
    stats: CacheStats,
}

impl Inner {
    fn generation(&self, prefix: &str) -> u64 {
        self.generations.get(prefix).copied().unwrap_or(0)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        let purged = before - self.entries.len();
        self.stats.expirations += purged as u64;
        purged
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<String> {
        let entries = self.entries.iter();
        let chosen = match policy {
            EvictionPolicy::Lru => entries.min_by_key(|(_, e)| e.access_seq),
            EvictionPolicy::Lfu => entries.min_by_key(|(_, e)| (e.hits, e.access_seq)),
            EvictionPolicy::Fifo => entries.min_by_key(|(_, e)| e.inserted_seq),
            EvictionPolicy::Ttl => {
                entries.min_by_key(|(_, e)| (e.expires_at.is_none(), e.expires_at, e.inserted_seq))
            }
        };
        chosen.map(|(k, _)| k.clone())
    }

    /// Make room for one more entry; returns the evicted keys.
    fn make_room(&mut self, max_entries: usize, policy: EvictionPolicy, now: Instant) -> Vec<String> {
        if self.entries.len() < max_entries {
            return Vec::new();
        }
        self.purge_expired(now);

        let mut evicted = Vec::new();
        while self.entries.len() >= max_entries {
            let Some(key) = self.victim(policy) else {
                break;
            };
            self.entries.remove(&key);
            self.stats.evictions += 1;
            evicted.push(key);
        }
        evicted
    }
}

/// Bounded cache of read results.
///
/// Safe for concurrent use; every method holds the internal lock only for
/// in-memory bookkeeping.
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                generations: HashMap::new(),
                seq: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Live value under `key`. Expired entries are removed and count as a miss.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let seq = inner.next_seq();

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.hits += 1;
                entry.last_access = now;
                entry.access_seq = seq;
                let value = entry.value.clone();
                inner.stats.hits += 1;
                return Some(value);
            }
            None => false,
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
        }
        inner.stats.misses += 1;
        None
    }

    /// Insert or overwrite an entry.
    ///
    /// `ttl` overrides the configured default. Returns the keys evicted to make
    /// room.
    pub fn put(
        &self,
        key: impl Into<String>,
        value: Value,
        filter: Option<Value>,
        ttl: Option<Duration>,
    ) -> Vec<String> {
        let key = key.into();
        let mut inner = self.inner.lock();
        let evicted = self.insert(&mut inner, key, value, filter, ttl);
        drop(inner);

        log_evicted(&evicted);
        evicted
    }

    /// Invalidation generation of `prefix`; capture it before fetching a
    /// value that is later stored with [`put_if_current`](Self::put_if_current).
    pub fn generation(&self, prefix: &str) -> u64 {
        self.inner.lock().generation(prefix)
    }

    /// Like [`put`](Self::put), but drops the value when `prefix` was
    /// invalidated after `generation` was taken. Returns `None` when dropped.
    pub fn put_if_current(
        &self,
        key: impl Into<String>,
        value: Value,
        filter: Option<Value>,
        ttl: Option<Duration>,
        prefix: &str,
        generation: u64,
    ) -> Option<Vec<String>> {
        let key = key.into();
        let mut inner = self.inner.lock();
        if inner.generation(prefix) != generation {
            debug!(key = %key, "Dropped stale read result");
            return None;
        }
        let evicted = self.insert(&mut inner, key, value, filter, ttl);
        drop(inner);

        log_evicted(&evicted);
        Some(evicted)
    }

    fn insert(
        &self,
        inner: &mut Inner,
        key: String,
        value: Value,
        filter: Option<Value>,
        ttl: Option<Duration>,
    ) -> Vec<String> {
        let now = Instant::now();
        let ttl = ttl.or(self.config.default_ttl);
        let size = value.to_string().len();

        let evicted = if inner.entries.contains_key(&key) {
            Vec::new()
        } else {
            inner.make_room(self.config.max_entries, self.config.policy, now)
        };
        let seq = inner.next_seq();

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                filter,
                inserted_at: now,
                last_access: now,
                expires_at: ttl.map(|t| now + t),
                hits: 0,
                size,
                inserted_seq: seq,
                access_seq: seq,
            },
        );
        evicted
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix` and advance the
    /// prefix's generation.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        *inner.generations.entry(prefix.to_string()).or_insert(0) += 1;
        let before = inner.entries.len();
        inner.entries.retain(|k, _| !k.starts_with(prefix));
        before - inner.entries.len()
    }

    /// Rewrite the value of every live entry under `prefix`.
    ///
    /// `update` receives the entry's value and the filter it was read with,
    /// and returns whether it changed anything. The returned record undoes
    /// exactly the entries that changed.
    pub fn update_prefix<F>(&self, prefix: &str, mut update: F) -> CacheRevert
    where
        F: FnMut(&mut Value, Option<&Value>) -> bool,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let generation = inner.generation(prefix);
        let mut changes = Vec::new();
        for (key, entry) in inner.entries.iter_mut() {
            if !key.starts_with(prefix) || entry.is_expired(now) {
                continue;
            }
            let original = entry.value.clone();
            if update(&mut entry.value, entry.filter.as_ref()) {
                entry.size = entry.value.to_string().len();
                changes.push(RevertedEntry {
                    key: key.clone(),
                    original,
                    speculative: entry.value.clone(),
                });
            }
        }
        changes.sort_by(|a, b| a.key.cmp(&b.key));

        CacheRevert {
            prefix: prefix.to_string(),
            generation,
            changes,
        }
    }

    /// Undo a speculative change. Returns the number of entries restored.
    ///
    /// Nothing is restored once the prefix has been invalidated since the
    /// change. An entry that no longer holds the speculative value is removed
    /// instead of restored.
    pub fn revert(&self, revert: &CacheRevert) -> usize {
        let mut inner = self.inner.lock();
        if inner.generation(&revert.prefix) != revert.generation {
            return 0;
        }

        let mut restored = 0;
        for change in &revert.changes {
            match inner.entries.get_mut(&change.key) {
                Some(entry) if entry.value == change.speculative => {
                    entry.value = change.original.clone();
                    entry.size = entry.value.to_string().len();
                    restored += 1;
                }
                Some(_) => {
                    inner.entries.remove(&change.key);
                }
                None => {}
            }
        }
        restored
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().purge_expired(Instant::now())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Raw entry under `key`, expired or not.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

fn log_evicted(evicted: &[String]) {
    for key in evicted {
        debug!(key = %key, "Evicted cache entry");
    }
}

/// Prefix shared by every cache key of a collection.
pub fn collection_prefix(collection: &str) -> String {
    format!("{}:", collection)
}

/// Cache key of a read: collection, filter, projection and paging.
///
/// Filters serialize with sorted object keys, so equal filters written in a
/// different field order share a key.
pub fn cache_key(operation: &CrudOperation) -> String {
    let filter = operation
        .filter
        .as_ref()
        .map(Value::to_string)
        .unwrap_or_default();
    let projection = operation
        .options
        .projection
        .as_ref()
        .map(|p| p.join(","))
        .unwrap_or_default();
    let sort = operation
        .options
        .sort
        .iter()
        .map(|s| format!("{}{}", if s.descending { "-" } else { "+" }, s.field))
        .collect::<Vec<_>>()
        .join(",");
    let skip = operation.options.skip.map(|n| n.to_string()).unwrap_or_default();
    let limit = operation.options.limit.map(|n| n.to_string()).unwrap_or_default();

    format!(
        "{}{}:{}:{}:{}:{}",
        collection_prefix(&operation.collection),
        filter,
        projection,
        sort,
        skip,
        limit
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyweave_common::SortKey;
    use serde_json::json;

    fn cache(max_entries: usize, policy: EvictionPolicy) -> ResultCache {
        ResultCache::new(CacheConfig {
            max_entries,
            default_ttl: None,
            policy,
        })
    }

    #[test]
    fn test_put_get() {
        let cache = cache(4, EvictionPolicy::Lru);
        cache.put("users:a", json!([1]), None, None);
        assert_eq!(cache.get("users:a"), Some(json!([1])));
        assert_eq!(cache.get("users:b"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = cache(2, EvictionPolicy::Lru);
        cache.put("a", json!(1), None, None);
        cache.put("b", json!(2), None, None);
        cache.get("a");

        let evicted = cache.put("c", json!(3), None, None);
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn test_lfu_eviction() {
        let cache = cache(2, EvictionPolicy::Lfu);
        cache.put("a", json!(1), None, None);
        cache.put("b", json!(2), None, None);
        cache.get("a");
        cache.get("a");
        cache.get("b");

        let evicted = cache.put("c", json!(3), None, None);
        assert_eq!(evicted, vec!["b".to_string()]);
    }

    #[test]
    fn test_fifo_eviction() {
        let cache = cache(2, EvictionPolicy::Fifo);
        cache.put("a", json!(1), None, None);
        cache.put("b", json!(2), None, None);
        cache.get("a");

        let evicted = cache.put("c", json!(3), None, None);
        assert_eq!(evicted, vec!["a".to_string()]);
    }

    #[test]
    fn test_ttl_eviction_prefers_soonest_expiry() {
        let cache = cache(2, EvictionPolicy::Ttl);
        cache.put("long", json!(1), None, Some(Duration::from_secs(60)));
        cache.put("short", json!(2), None, Some(Duration::from_secs(5)));

        let evicted = cache.put("c", json!(3), None, None);
        assert_eq!(evicted, vec!["short".to_string()]);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = cache(1, EvictionPolicy::Lru);
        cache.put("a", json!(1), None, None);
        assert!(cache.put("a", json!(2), None, None).is_empty());
        assert_eq!(cache.get("a"), Some(json!(2)));
    }

    #[test]
    fn test_expired_entry_is_miss() {
        let cache = cache(4, EvictionPolicy::Lru);
        cache.put("a", json!(1), None, Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("a"), None);
        assert!(!cache.contains("a"));
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_invalidate_by_prefix() {
        let cache = cache(8, EvictionPolicy::Lru);
        cache.put("users:1", json!(1), None, None);
        cache.put("users:2", json!(2), None, None);
        cache.put("orders:1", json!(3), None, None);

        assert_eq!(cache.invalidate_by_prefix("users:"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate("orders:1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_revert_restores_only_changed_entries() {
        let cache = cache(8, EvictionPolicy::Lru);
        cache.put("users:a", json!([{"id": 1}]), Some(json!({})), None);
        cache.put("users:b", json!([{"id": 2}]), None, None);
        cache.put("orders:a", json!([]), None, None);
        let before = cache.entry("users:a").unwrap();

        let revert = cache.update_prefix("users:", |value, filter| {
            if filter.is_none() {
                return false;
            }
            *value = json!([]);
            true
        });
        assert_eq!(revert.len(), 1);
        cache.put("users:c", json!([3]), None, None);

        assert_eq!(cache.revert(&revert), 1);
        assert_eq!(cache.entry("users:a").unwrap(), before);
        assert_eq!(cache.get("users:b"), Some(json!([{"id": 2}])));
        assert!(cache.contains("users:c"));
        assert!(cache.contains("orders:a"));
    }

    #[test]
    fn test_revert_skipped_after_invalidation() {
        let cache = cache(8, EvictionPolicy::Lru);
        cache.put("users:a", json!([1]), None, None);
        let revert = cache.update_prefix("users:", |value, _| {
            *value = json!([1, 2]);
            true
        });

        cache.invalidate_by_prefix("users:");
        cache.put("users:b", json!([5]), None, None);

        assert_eq!(cache.revert(&revert), 0);
        assert!(!cache.contains("users:a"));
        assert_eq!(cache.get("users:b"), Some(json!([5])));
    }

    #[test]
    fn test_revert_drops_entry_changed_since() {
        let cache = cache(8, EvictionPolicy::Lru);
        cache.put("users:a", json!([1]), None, None);
        let revert = cache.update_prefix("users:", |value, _| {
            *value = json!([1, 2]);
            true
        });
        cache.update_prefix("users:", |value, _| {
            *value = json!([1, 2, 3]);
            true
        });

        assert_eq!(cache.revert(&revert), 0);
        assert!(!cache.contains("users:a"));
    }

    #[test]
    fn test_put_if_current_drops_stale_value() {
        let cache = cache(8, EvictionPolicy::Lru);
        let generation = cache.generation("users:");

        cache.invalidate_by_prefix("users:");
        assert!(cache
            .put_if_current("users:a", json!([1]), None, None, "users:", generation)
            .is_none());
        assert!(!cache.contains("users:a"));

        let generation = cache.generation("users:");
        cache.invalidate_by_prefix("orders:");
        assert!(cache
            .put_if_current("users:a", json!([2]), None, None, "users:", generation)
            .is_some());
        assert_eq!(cache.get("users:a"), Some(json!([2])));
    }

    #[test]
    fn test_cache_key_is_canonical() {
        let a = CrudOperation::read("users", json!({"a": 1, "b": 2}));
        let b = CrudOperation::read("users", json!({"b": 2, "a": 1}));
        assert_eq!(cache_key(&a), cache_key(&b));
        assert!(cache_key(&a).starts_with("users:"));

        let mut c = CrudOperation::read("users", json!({"a": 1, "b": 2}));
        c.options.sort = vec![SortKey {
            field: "a".to_string(),
            descending: true,
        }];
        assert_ne!(cache_key(&a), cache_key(&c));
    }
}
