//! TTL + eviction cache for market data.
//!
//! Namespaced string keys of the form `<namespace>:<type>:<symbol>[:params]`.
//! Entries expire TTL after creation; when full, inserting a new key evicts
//! exactly one entry according to the configured policy. All mutations run
//! under one short-held mutex per instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Eviction policy applied when the cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the entry with the oldest `last_accessed`.
    Lru,
    /// Evict the entry with the oldest creation time.
    Fifo,
    /// Evict the entry with the lowest access count; ties broken by the
    /// older `last_accessed`.
    Lfu,
}

/// Cache tuning, fixed at construction.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl: Duration,
    pub policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(30),
            policy: EvictionPolicy::Lru,
        }
    }
}

/// Counters exposed by `stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

/// Thread-safe TTL cache with bounded size.
pub struct MarketCache<V> {
    inner: Mutex<CacheInner<V>>,
    config: CacheConfig,
}

/// Build the canonical full key `<namespace>:<type>:<symbol>[:params]`.
pub fn full_key(namespace: &str, kind: &str, symbol: &str, params: &[(&str, &str)]) -> String {
    let mut key = format!("{namespace}:{kind}:{symbol}");
    if !params.is_empty() {
        key.push(':');
        let encoded: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        key.push_str(&encoded.join("&"));
    }
    key
}

impl<V: Clone> MarketCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
            config,
        }
    }

    /// Look up a key. An expired entry counts as a miss and is removed.
    pub fn get(&self, key: &str) -> Option<V> {
        enum Lookup<V> {
            Hit(V),
            Expired,
            Missing,
        }

        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let lookup = match inner.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.created_at) < self.config.ttl => {
                entry.last_accessed = now;
                entry.access_count += 1;
                Lookup::Hit(entry.value.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        };
        match lookup {
            Lookup::Hit(value) => {
                inner.hits += 1;
                Some(value)
            }
            Lookup::Expired => {
                inner.entries.remove(key);
                inner.expirations += 1;
                inner.misses += 1;
                None
            }
            Lookup::Missing => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or refresh a key. Inserting a new key into a full cache
    /// evicts exactly one entry first.
    pub fn set(&self, key: &str, value: V) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if !inner.entries.contains_key(key) && inner.entries.len() >= self.config.max_size {
            if let Some(victim) = Self::pick_victim(&inner.entries, self.config.policy) {
                inner.entries.remove(&victim);
                inner.evictions += 1;
                tracing::debug!(key = %victim, "cache entry evicted");
            }
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                created_at: now,
                last_accessed: now,
                access_count: 0,
            },
        );
    }

    /// Whether a fresh (unexpired) entry exists. Does not touch access
    /// statistics.
    pub fn has(&self, key: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(key)
            .map(|e| e.created_at.elapsed() < self.config.ttl)
            .unwrap_or(false)
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().unwrap().entries.remove(key).is_some()
    }

    /// Remove every entry under a namespace prefix.
    pub fn clear_namespace(&self, namespace: &str) {
        let prefix = format!("{namespace}:");
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Remove everything.
    pub fn clear(&self) {
        self.inner.lock().unwrap().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let ttl = self.config.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.created_at.elapsed() < ttl);
        let removed = before - inner.entries.len();
        inner.expirations += removed as u64;
        removed
    }

    /// Sweep cadence: `min(TTL / 2, 30s)`.
    pub fn sweep_interval(&self) -> Duration {
        (self.config.ttl / 2).min(Duration::from_secs(30))
    }

    fn pick_victim(entries: &HashMap<String, Entry<V>>, policy: EvictionPolicy) -> Option<String> {
        let victim = match policy {
            EvictionPolicy::Lru => entries.iter().min_by_key(|(_, e)| e.last_accessed),
            EvictionPolicy::Fifo => entries.iter().min_by_key(|(_, e)| e.created_at),
            EvictionPolicy::Lfu => entries
                .iter()
                .min_by_key(|(_, e)| (e.access_count, e.last_accessed)),
        };
        victim.map(|(key, _)| key.clone())
    }
}

impl<V: Clone + Send + 'static> MarketCache<V> {
    /// Background task sweeping expired entries on the cadence of
    /// `sweep_interval`.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = cache.sweep_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "cache sweep removed expired entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize, ttl_ms: u64, policy: EvictionPolicy) -> MarketCache<String> {
        MarketCache::new(CacheConfig {
            max_size,
            ttl: Duration::from_millis(ttl_ms),
            policy,
        })
    }

    #[test]
    fn test_set_then_get() {
        let cache = cache(10, 1000, EvictionPolicy::Lru);
        cache.set("market:priceTick:BTCUSDT", "tick".to_string());
        assert_eq!(
            cache.get("market:priceTick:BTCUSDT").as_deref(),
            Some("tick")
        );
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_removed() {
        let cache = cache(10, 20, EvictionPolicy::Lru);
        cache.set("k", "v".to_string());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_size_never_exceeds_max() {
        let cache = cache(3, 10_000, EvictionPolicy::Fifo);
        for i in 0..20 {
            cache.set(&format!("k{i}"), "v".to_string());
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 17);
    }

    #[test]
    fn test_lru_evicts_least_recently_accessed() {
        let cache = cache(2, 10_000, EvictionPolicy::Lru);
        cache.set("old", "v".to_string());
        std::thread::sleep(Duration::from_millis(5));
        cache.set("new", "v".to_string());
        std::thread::sleep(Duration::from_millis(5));
        // Touch "old" so "new" becomes the LRU victim.
        cache.get("old");
        cache.set("third", "v".to_string());
        assert!(cache.has("old"));
        assert!(!cache.has("new"));
    }

    #[test]
    fn test_fifo_evicts_oldest_creation() {
        let cache = cache(2, 10_000, EvictionPolicy::Fifo);
        cache.set("first", "v".to_string());
        std::thread::sleep(Duration::from_millis(5));
        cache.set("second", "v".to_string());
        // Accessing "first" must not save it under FIFO.
        cache.get("first");
        cache.set("third", "v".to_string());
        assert!(!cache.has("first"));
        assert!(cache.has("second"));
    }

    #[test]
    fn test_lfu_evicts_least_frequently_used() {
        let cache = cache(2, 10_000, EvictionPolicy::Lfu);
        cache.set("hot", "v".to_string());
        cache.set("cold", "v".to_string());
        cache.get("hot");
        cache.get("hot");
        cache.get("cold");
        cache.set("third", "v".to_string());
        assert!(cache.has("hot"));
        assert!(!cache.has("cold"));
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = cache(2, 10_000, EvictionPolicy::Lru);
        cache.set("a", "1".to_string());
        cache.set("b", "2".to_string());
        cache.set("a", "3".to_string());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("3"));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_clear_namespace_removes_prefix_only() {
        let cache = cache(10, 10_000, EvictionPolicy::Lru);
        cache.set("market:priceTick:BTCUSDT", "v".to_string());
        cache.set("market:orderBook:BTCUSDT", "v".to_string());
        cache.set("other:priceTick:BTCUSDT", "v".to_string());
        cache.clear_namespace("market");
        assert_eq!(cache.len(), 1);
        assert!(cache.has("other:priceTick:BTCUSDT"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = cache(10, 40, EvictionPolicy::Lru);
        cache.set("old", "v".to_string());
        std::thread::sleep(Duration::from_millis(50));
        cache.set("fresh", "v".to_string());
        let removed = cache.sweep();
        assert_eq!(removed, 1);
        assert!(cache.has("fresh"));
    }

    #[test]
    fn test_sweep_interval_capped() {
        let short = cache(10, 20_000, EvictionPolicy::Lru);
        assert_eq!(short.sweep_interval(), Duration::from_secs(10));
        let long = cache(10, 120_000, EvictionPolicy::Lru);
        assert_eq!(long.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_full_key_formats() {
        assert_eq!(
            full_key("market", "priceTick", "BTCUSDT", &[]),
            "market:priceTick:BTCUSDT"
        );
        assert_eq!(
            full_key("market", "kline", "BTCUSDT", &[("interval", "1m"), ("limit", "100")]),
            "market:kline:BTCUSDT:interval=1m&limit=100"
        );
    }

    #[test]
    fn test_delete_is_idempotent() {
        let cache = cache(10, 10_000, EvictionPolicy::Lru);
        cache.set("k", "v".to_string());
        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
    }
}
