//! Expiring key/value cache with hit/miss accounting and bulk warmup.

use crate::utils::error::{MonitorError, Result};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Live (unexpired) entries.
    pub size: usize,
    pub hit_rate: f64,
}

/// One key to populate during [`TtlCache::warmup`].
pub struct WarmupItem<'a, K, V> {
    pub key: K,
    pub ttl: Duration,
    pub producer: BoxFuture<'a, Result<V>>,
}

impl<'a, K, V> WarmupItem<'a, K, V> {
    pub fn new<F>(key: K, ttl: Duration, producer: F) -> Self
    where
        F: Future<Output = Result<V>> + Send + 'a,
    {
        Self {
            key,
            ttl,
            producer: Box::pin(producer),
        }
    }
}

#[derive(Debug)]
pub struct WarmupReport<K> {
    pub loaded: usize,
    /// Keys whose producer failed, with the error it returned.
    pub failures: Vec<(K, MonitorError)>,
}

impl<K> WarmupReport<K> {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

fn settle_warmup_item<'a, K, V>(item: WarmupItem<'a, K, V>) -> BoxFuture<'a, (K, Duration, Result<V>)>
where
    K: Send + 'a,
    V: Send + 'a,
{
    Box::pin(async move {
        let outcome = item.producer.await;
        (item.key, item.ttl, outcome)
    })
}

/// Type-erased handle the resource manager uses to drop every registered
/// cache under memory pressure.
pub trait CacheClear: Send + Sync {
    fn name(&self) -> &str;
    fn clear(&self);
}

pub struct TtlCache<K, V> {
    name: String,
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Debug + Send,
    V: Clone + Send,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries();

        let value = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries().insert(key, entry);
    }

    /// Presence check that does not touch the hit/miss counters.
    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        self.entries()
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries().remove(key).map(|entry| entry.value)
    }

    /// Runs the producers with at most `concurrency` in flight and stores the
    /// ones that succeed. Failed keys are left unset and returned in the report.
    pub async fn warmup<'a>(
        &self,
        items: Vec<WarmupItem<'a, K, V>>,
        concurrency: usize,
    ) -> WarmupReport<K>
    where
        K: 'a,
        V: 'a,
    {
        let total = items.len();
        let pending: Vec<BoxFuture<'a, (K, Duration, Result<V>)>> =
            items.into_iter().map(settle_warmup_item).collect();
        let settled: Vec<(K, Duration, Result<V>)> = stream::iter(pending)
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = WarmupReport {
            loaded: 0,
            failures: Vec::new(),
        };
        for (key, ttl, outcome) in settled {
            match outcome {
                Ok(value) => {
                    self.set(key, value, ttl);
                    report.loaded += 1;
                }
                Err(e) => {
                    tracing::warn!("Cache '{}' warmup skipped {:?}: {}", self.name, key, e);
                    report.failures.push((key, e));
                }
            }
        }

        tracing::debug!(
            "Cache '{}' warmed {}/{} entries",
            self.name,
            report.loaded,
            total
        );
        report
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Drops every entry and resets the hit/miss counters.
    pub fn clear(&self) {
        self.entries().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let size = self
            .entries()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            size,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<K, V> CacheClear for TtlCache<K, V>
where
    K: Eq + Hash + Debug + Send,
    V: Clone + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn clear(&self) {
        TtlCache::clear(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::MonitorError;

    fn cache() -> TtlCache<String, u32> {
        TtlCache::new("test")
    }

    #[tokio::test]
    async fn test_get_missing_key_is_absent() {
        let cache = cache();
        assert_eq!(cache.get(&"nope".to_string()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_behaves_as_absent_and_is_purged() {
        let cache = cache();
        cache.set("a".to_string(), 1, Duration::from_secs(10));
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_set_wins_regardless_of_ttl() {
        let cache = cache();
        cache.set("a".to_string(), 1, Duration::from_secs(60));
        cache.set("a".to_string(), 2, Duration::from_secs(5));

        assert_eq!(cache.get(&"a".to_string()), Some(2));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[tokio::test]
    async fn test_hit_rate_is_zero_without_accesses() {
        let cache = cache();
        assert_eq!(cache.stats().hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_hit_rate_is_zero_after_only_misses() {
        let cache = cache();
        for i in 0..5 {
            assert!(cache.get(&format!("k{}", i)).is_none());
        }
        let stats = cache.stats();
        assert_eq!(stats.misses, 5);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_hit_rate_counts_hits_and_misses() {
        let cache = cache();
        cache.set("a".to_string(), 1, Duration::from_secs(60));
        cache.get(&"a".to_string());
        cache.get(&"a".to_string());
        cache.get(&"a".to_string());
        cache.get(&"b".to_string());

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_warmup_skips_failing_producer() {
        let cache = cache();
        let items: Vec<WarmupItem<'_, String, u32>> = (0..5u32)
            .map(|i| {
                WarmupItem::new(format!("k{}", i), Duration::from_secs(60), async move {
                    if i == 2 {
                        Err(MonitorError::Timeout {
                            after: Duration::from_secs(1),
                        })
                    } else {
                        Ok(i * 10)
                    }
                })
            })
            .collect();

        let report = cache.warmup(items, 5).await;

        assert_eq!(report.loaded, 4);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.failures[0].0, "k2");
        assert_eq!(cache.get(&"k0".to_string()), Some(0));
        assert_eq!(cache.get(&"k1".to_string()), Some(10));
        assert_eq!(cache.get(&"k2".to_string()), None);
        assert_eq!(cache.get(&"k3".to_string()), Some(30));
        assert_eq!(cache.get(&"k4".to_string()), Some(40));
    }

    #[tokio::test]
    async fn test_warmup_bounds_producers_in_flight() {
        use std::sync::atomic::AtomicUsize;

        let cache = cache();
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let items: Vec<WarmupItem<'_, String, u32>> = (0..6u32)
            .map(|i| {
                let (in_flight, peak) = (&in_flight, &peak);
                WarmupItem::new(format!("k{}", i), Duration::from_secs(60), async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(i)
                })
            })
            .collect();

        let report = cache.warmup(items, 2).await;

        assert_eq!(report.loaded, 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_clear_resets_entries_and_counters() {
        let cache = cache();
        cache.set("a".to_string(), 1, Duration::from_secs(60));
        cache.get(&"a".to_string());
        cache.get(&"b".to_string());

        cache.clear();

        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_and_size_excludes_stale_entries() {
        let cache = cache();
        cache.set("short".to_string(), 1, Duration::from_secs(1));
        cache.set("long".to_string(), 2, Duration::from_secs(100));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.stats().size, 1);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get(&"long".to_string()), Some(2));
    }
}
