use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CacheConfig, CacheKey, CacheMetrics};

struct CacheEntry {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
    /// Position in insertion order
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn sweep_expired(&mut self, now: Instant) -> u64 {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len() as u64
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.order.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    /// Look up a live entry, dropping it if it has expired
    fn get_live(&mut self, key: &str, now: Instant) -> Lookup<'_> {
        let expired = match self.entries.get(key) {
            None => return Lookup::Missing,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.remove(key);
            return Lookup::Expired;
        }
        match self.entries.get(key) {
            Some(entry) => Lookup::Live(&entry.value),
            None => Lookup::Missing,
        }
    }
}

enum Lookup<'a> {
    Live(&'a Value),
    Expired,
    Missing,
}

/// In-process key/value store with per-entry TTL and a capacity bound.
///
/// Entries expire lazily: a stale entry is removed when it is next read, or when
/// `size` or a capacity-triggered sweep runs. When a new key arrives at capacity, expired
/// entries are swept first and then the earliest-inserted entry is evicted. Reads never
/// change an entry's position.
pub struct EphemeralCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    default_ttl: Duration,
    metrics: CacheMetrics,
}

impl EphemeralCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries: config.max_entries.max(1),
            default_ttl: config.default_ttl(),
            metrics: CacheMetrics::default(),
        }
    }

    // The guarded state is consistent after every statement, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// TTL for a typed key: its kind's default, falling back to the cache-wide default
    pub fn ttl_for(&self, key: &CacheKey) -> Duration {
        key.kind().default_ttl().unwrap_or(self.default_ttl)
    }

    /// Store `value` under `key`. Overwriting a key resets its age and moves it to the
    /// newest insertion position.
    pub fn set(&self, key: impl AsRef<str>, value: Value, ttl: Option<Duration>) {
        let mut state = self.lock();
        self.insert(&mut state, key.as_ref(), value, ttl, Instant::now());
    }

    fn insert(
        &self,
        state: &mut CacheState,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
        now: Instant,
    ) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        if state.remove(key).is_none() && state.entries.len() >= self.max_entries {
            let expired = state.sweep_expired(now);
            self.metrics.record_expirations(expired);
            if state.entries.len() >= self.max_entries {
                if let Some(evicted) = state.evict_oldest() {
                    self.metrics.record_eviction();
                    debug!(key = %evicted, "Evicted oldest cache entry");
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.to_string());
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
                seq,
            },
        );
    }

    /// Serialize and store a typed value
    pub fn set_as<T: Serialize>(
        &self,
        key: impl AsRef<str>,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, ttl);
        Ok(())
    }

    /// Store `value` unless the live entry under `key` deserializes to a `T` that
    /// `keep_current` accepts. The check and the write happen under one lock.
    /// Returns whichever value the cache holds afterwards.
    pub fn set_unless<T, F>(
        &self,
        key: impl AsRef<str>,
        value: T,
        ttl: Option<Duration>,
        keep_current: F,
    ) -> Result<T, serde_json::Error>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&T) -> bool,
    {
        let key = key.as_ref();
        let now = Instant::now();
        let mut state = self.lock();
        let current = match state.get_live(key, now) {
            Lookup::Live(current) => serde_json::from_value::<T>(current.clone()).ok(),
            Lookup::Expired => {
                self.metrics.record_expirations(1);
                None
            }
            Lookup::Missing => None,
        };
        if let Some(current) = current {
            if keep_current(&current) {
                return Ok(current);
            }
        }
        let encoded = serde_json::to_value(&value)?;
        self.insert(&mut state, key, encoded, ttl, now);
        Ok(value)
    }

    pub fn get(&self, key: impl AsRef<str>) -> Option<Value> {
        let now = Instant::now();
        let mut state = self.lock();
        match state.get_live(key.as_ref(), now) {
            Lookup::Live(value) => {
                let value = value.clone();
                self.metrics.record_hit();
                Some(value)
            }
            Lookup::Expired => {
                self.metrics.record_expirations(1);
                self.metrics.record_miss();
                None
            }
            Lookup::Missing => {
                self.metrics.record_miss();
                None
            }
        }
    }

    /// Fetch and deserialize a typed value. A value of the wrong shape counts as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, key: impl AsRef<str>) -> Option<T> {
        let key = key.as_ref();
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key, error = %e, "Cached value did not match requested type");
                None
            }
        }
    }

    pub fn has(&self, key: impl AsRef<str>) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        match state.get_live(key.as_ref(), now) {
            Lookup::Live(_) => true,
            Lookup::Expired => {
                self.metrics.record_expirations(1);
                false
            }
            Lookup::Missing => false,
        }
    }

    /// Remove `key`, returning whether an entry was present
    pub fn delete(&self, key: impl AsRef<str>) -> bool {
        self.lock().remove(key.as_ref()).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
    }

    /// Number of live entries. Sweeps expired entries first.
    pub fn size(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired = state.sweep_expired(now);
        self.metrics.record_expirations(expired);
        state.entries.len()
    }

    /// Return the cached value for `key`, or run `compute` and cache its result.
    ///
    /// An `Err` from `compute` is returned as is and nothing is cached. Concurrent misses
    /// on the same key each run `compute`; the last one to finish wins.
    pub async fn with_cache<T, E, F, Fut>(
        &self,
        key: impl AsRef<str>,
        compute: F,
        ttl: Option<Duration>,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = key.as_ref();
        if let Some(cached) = self.get_as(key) {
            return Ok(cached);
        }

        let value = compute().await?;
        if let Err(e) = self.set_as(key, &value, ttl) {
            warn!(key, error = %e, "Failed to serialize value for cache; returning it uncached");
        }
        Ok(value)
    }

    /// Invalidate by pattern. Any pattern containing `*` clears the whole cache;
    /// anything else removes that exact key.
    pub fn invalidate_cache(&self, pattern: &str) {
        if pattern.contains('*') {
            debug!(pattern, "Wildcard invalidation; clearing cache");
            self.clear();
        } else {
            self.delete(pattern);
        }
    }

    /// Remove every key starting with `prefix`, returning how many were removed
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKind;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(max_entries: usize) -> EphemeralCache {
        EphemeralCache::new(&CacheConfig {
            max_entries,
            default_ttl_ms: 60_000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get() {
        let cache = cache(10);
        cache.set("user:1", json!({"name": "Ada"}), None);

        assert_eq!(cache.get("user:1"), Some(json!({"name": "Ada"})));
        assert!(cache.has("user:1"));
        assert_eq!(cache.get("user:2"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = cache(10);
        cache.set("chats:1", json!([1, 2, 3]), Some(Duration::from_millis(1000)));

        // Exactly at the TTL the entry is still live
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(cache.has("chats:1"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("chats:1"), None);
        assert!(!cache.has("chats:1"));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.metrics().expirations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest_inserted() {
        let cache = cache(3);
        cache.set("a", json!(1), None);
        cache.set("b", json!(2), None);
        cache.set("c", json!(3), None);

        // Reads do not refresh insertion order
        assert!(cache.get("a").is_some());

        cache.set("d", json!(4), None);
        assert_eq!(cache.size(), 3);
        assert!(!cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.has("d"));
        assert_eq!(cache.metrics().evictions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_prefers_expired_entries() {
        let cache = cache(3);
        cache.set("a", json!(1), None);
        cache.set("short", json!(2), Some(Duration::from_millis(10)));
        cache.set("c", json!(3), None);

        tokio::time::advance(Duration::from_millis(20)).await;
        cache.set("d", json!(4), None);

        // The expired entry made room, so the oldest live entry survives
        assert!(cache.has("a"));
        assert!(cache.has("c"));
        assert!(cache.has("d"));
        assert_eq!(cache.metrics().evictions.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_inserts_stay_within_capacity() {
        let cache = cache(50);
        for i in 0..51 {
            cache.set(format!("documents:{i}"), json!(i), None);
        }
        assert!(cache.size() <= 50);
        assert!(!cache.has("documents:0"));
        assert!(cache.has("documents:50"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_moves_to_newest_and_resets_age() {
        let cache = cache(2);
        cache.set("a", json!(1), Some(Duration::from_millis(100)));
        cache.set("b", json!(2), None);

        tokio::time::advance(Duration::from_millis(80)).await;
        cache.set("a", json!(10), Some(Duration::from_millis(100)));

        // Overwrite does not count as a new key, so nothing is evicted
        assert_eq!(cache.size(), 2);

        // "b" is now the oldest
        cache.set("c", json!(3), None);
        assert!(!cache.has("b"));
        assert_eq!(cache.get("a"), Some(json!(10)));

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(cache.has("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_clear() {
        let cache = cache(10);
        cache.set("a", json!(1), None);
        cache.set("b", json!(2), None);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.size(), 1);

        cache.clear();
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_is_idempotent() {
        let cache = cache(10);
        cache.set("user:1", json!(1), None);
        cache.set("user:2", json!(2), None);

        cache.invalidate_cache("user:1");
        cache.invalidate_cache("user:1");
        assert!(!cache.has("user:1"));
        assert!(cache.has("user:2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_invalidation_clears_everything() {
        let cache = cache(10);
        cache.set("user:1", json!(1), None);
        cache.set("chats:1", json!(2), None);

        cache.invalidate_cache("user:*");
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_prefix() {
        let cache = cache(10);
        cache.set(CacheKey::user(1), json!(1), None);
        cache.set(CacheKey::user(2), json!(2), None);
        cache.set(CacheKey::chats(1), json!(3), None);

        let removed = cache.invalidate_prefix(&CacheKey::prefix_for(&CacheKind::User));
        assert_eq!(removed, 2);
        assert!(cache.has(CacheKey::chats(1)));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        plan: String,
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_cache_computes_once() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(Profile {
                name: "Ada".to_string(),
                plan: "pro".to_string(),
            })
        };

        let first = cache.with_cache("user:1", compute, None).await.unwrap();
        let second = cache.with_cache("user:1", compute, None).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_cache_recomputes_after_expiry() {
        let cache = cache(10);
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let compute = move || async move { Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst)) };
        let ttl = Some(Duration::from_millis(50));

        assert_eq!(cache.with_cache("k", compute, ttl).await.unwrap(), 0);
        tokio::time::advance(Duration::from_millis(51)).await;
        assert_eq!(cache.with_cache("k", compute, ttl).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_cache_error_is_not_cached() {
        let cache = cache(10);

        let result: Result<u32, String> = cache
            .with_cache("k", || async { Err("database down".to_string()) }, None)
            .await;
        assert_eq!(result.unwrap_err(), "database down");
        assert!(!cache.has("k"));

        let result: Result<u32, String> = cache.with_cache("k", || async { Ok(7) }, None).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cache.get("k"), Some(json!(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_unless_keeps_accepted_value() {
        let cache = cache(10);
        cache.set("usage:ip:1.2.3.4", json!(5), None);

        let kept = cache
            .set_unless("usage:ip:1.2.3.4", 3u64, None, |current: &u64| *current >= 3)
            .unwrap();
        assert_eq!(kept, 5);
        assert_eq!(cache.get("usage:ip:1.2.3.4"), Some(json!(5)));

        let stored = cache
            .set_unless("usage:ip:1.2.3.4", 7u64, None, |current: &u64| *current >= 7)
            .unwrap();
        assert_eq!(stored, 7);
        assert_eq!(cache.get("usage:ip:1.2.3.4"), Some(json!(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_unless_ignores_expired_or_foreign_values() {
        let cache = cache(10);
        cache.set("a", json!(10), Some(Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(101)).await;
        let stored = cache.set_unless("a", 1u64, None, |_: &u64| true).unwrap();
        assert_eq!(stored, 1);

        cache.set("b", json!("not a number"), None);
        let stored = cache.set_unless("b", 2u64, None, |_: &u64| true).unwrap();
        assert_eq!(stored, 2);
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_as_wrong_shape_is_miss() {
        let cache = cache(10);
        cache.set("user:1", json!("not a profile"), None);

        assert!(cache.get_as::<Profile>("user:1").is_none());
        assert_eq!(cache.get_as::<String>("user:1").unwrap(), "not a profile");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_for_key_kind() {
        let cache = cache(10);
        assert_eq!(cache.ttl_for(&CacheKey::user(1)), Duration::from_secs(300));
        assert_eq!(
            cache.ttl_for(&CacheKey::new(CacheKind::Custom("misc".to_string()), 1)),
            Duration::from_secs(60)
        );
    }
}
