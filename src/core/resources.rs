//! Lifecycle tracking for fetch channels and other handles that must be torn
//! down explicitly.
//!
//! Every registered resource is released exactly once, by whichever of these
//! gets to it first: a manual [`ResourceManager::release`], the periodic
//! idle/age sweep, a memory-pressure sweep, the count ceiling, or
//! [`ResourceManager::shutdown`]. A resource is removed from tracking before
//! its release callback runs, so two paths can never both see it.

use crate::core::cache::CacheClear;
use crate::utils::error::{MonitorError, Result};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    FetchChannel,
    HttpClient,
    Other,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    /// Percentage of tracked resources evicted at this level.
    pub fn eviction_percent(self) -> usize {
        match self {
            PressureLevel::Low => 0,
            PressureLevel::Medium => 20,
            PressureLevel::High => 50,
            PressureLevel::Critical => 80,
        }
    }
}

pub trait MemoryProbe: Send + Sync {
    /// Current memory use of this process in MB, `None` when unavailable.
    fn used_memory_mb(&self) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryThresholds {
    pub medium_mb: u64,
    pub high_mb: u64,
    pub critical_mb: u64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            medium_mb: 512,
            high_mb: 1024,
            critical_mb: 1536,
        }
    }
}

impl MemoryThresholds {
    pub fn classify(&self, used_mb: u64) -> PressureLevel {
        if used_mb >= self.critical_mb {
            PressureLevel::Critical
        } else if used_mb >= self.high_mb {
            PressureLevel::High
        } else if used_mb >= self.medium_mb {
            PressureLevel::Medium
        } else {
            PressureLevel::Low
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub max_age: Duration,
    pub max_idle: Duration,
    pub max_resource_count: usize,
    pub sweep_interval: Duration,
    pub pressure_interval: Duration,
    pub memory: MemoryThresholds,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_idle: Duration::from_secs(5 * 60),
            max_resource_count: 50,
            sweep_interval: Duration::from_secs(60),
            pressure_interval: Duration::from_secs(30),
            memory: MemoryThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictionReason {
    Manual,
    Expired,
    Pressure(PressureLevel),
    Ceiling,
    Shutdown,
}

struct TrackedResource {
    id: ResourceId,
    kind: ResourceKind,
    created_at: Instant,
    last_used_at: Instant,
    priority: i32,
    release: ReleaseFn,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ResourceStats {
    pub created: u64,
    pub cleaned: u64,
    pub release_failures: u64,
    pub sweep_runs: u64,
    pub pressure_events: u64,
    pub reclaim_hints: u64,
    /// Resources whose release did not finish within the shutdown timeout.
    pub abandoned: u64,
    pub active: usize,
    pub by_kind: HashMap<ResourceKind, usize>,
    pub last_pressure: PressureLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureReport {
    pub level: PressureLevel,
    pub evicted: usize,
    pub caches_cleared: usize,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    cleaned: AtomicU64,
    release_failures: AtomicU64,
    sweep_runs: AtomicU64,
    pressure_events: AtomicU64,
    reclaim_hints: AtomicU64,
    abandoned: AtomicU64,
}

pub struct ResourceManager {
    limits: ResourceLimits,
    probe: Arc<dyn MemoryProbe>,
    resources: Mutex<HashMap<ResourceId, TrackedResource>>,
    caches: Mutex<Vec<Arc<dyn CacheClear>>>,
    last_pressure: Mutex<PressureLevel>,
    next_id: AtomicU64,
    counters: Counters,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            limits,
            probe,
            resources: Mutex::new(HashMap::new()),
            caches: Mutex::new(Vec::new()),
            last_pressure: Mutex::new(PressureLevel::Low),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Caches registered here are cleared at `High` pressure and above.
    pub fn register_cache(&self, cache: Arc<dyn CacheClear>) {
        tracing::debug!("Registered cache '{}' for pressure clearing", cache.name());
        lock(&self.caches).push(cache);
    }

    /// Starts tracking a resource. `release` runs at most once, whenever the
    /// resource is evicted or released.
    ///
    /// After [`shutdown`](Self::shutdown) the resource is released at once
    /// and `MonitorError::Shutdown` is returned.
    pub async fn register<F, Fut>(
        &self,
        kind: ResourceKind,
        priority: i32,
        release: F,
    ) -> Result<ResourceId>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let release: ReleaseFn =
            Box::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(release()) });

        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let now = Instant::now();
        // `closed` is checked under the map lock; shutdown sets it before it
        // drains, so a resource is either drained or never inserted.
        let inserted = {
            let mut resources = lock(&self.resources);
            if self.closed.load(Ordering::SeqCst) {
                Err(release)
            } else {
                resources.insert(
                    id,
                    TrackedResource {
                        id,
                        kind,
                        created_at: now,
                        last_used_at: now,
                        priority,
                        release,
                    },
                );
                Ok(resources.len() > self.limits.max_resource_count)
            }
        };
        let over_ceiling = match inserted {
            Ok(over_ceiling) => over_ceiling,
            Err(release) => {
                if let Err(e) = release().await {
                    tracing::warn!("Release after shutdown failed: {}", e);
                }
                return Err(MonitorError::Shutdown);
            }
        };
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Registered {} ({:?}, priority {})", id, kind, priority);

        if over_ceiling {
            self.enforce_ceiling().await;
        }

        Ok(id)
    }

    /// Refreshes `last_used_at`. Returns false if the resource is no longer
    /// tracked (already evicted).
    pub fn touch(&self, id: ResourceId) -> bool {
        match lock(&self.resources).get_mut(&id) {
            Some(resource) => {
                resource.last_used_at = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, id: ResourceId) -> bool {
        lock(&self.resources).contains_key(&id)
    }

    /// Manual cleanup. `Ok(false)` when the resource was already gone; a
    /// failing release is returned but the resource is untracked regardless.
    pub async fn release(&self, id: ResourceId) -> Result<bool> {
        let removed = lock(&self.resources).remove(&id);
        let Some(resource) = removed else {
            return Ok(false);
        };
        self.counters.cleaned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Releasing {} ({:?})", id, EvictionReason::Manual);

        match (resource.release)().await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.counters.release_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Release of {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    /// Evicts everything older than `max_age` or idle longer than `max_idle`.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let max_age = self.limits.max_age;
        let max_idle = self.limits.max_idle;

        let expired = self.take_where(|r| {
            now.duration_since(r.created_at) > max_age
                || now.duration_since(r.last_used_at) > max_idle
        });
        self.counters.sweep_runs.fetch_add(1, Ordering::Relaxed);

        let count = expired.len();
        if count > 0 {
            tracing::debug!("Sweep evicting {} expired resources", count);
        }
        self.release_all(expired, EvictionReason::Expired).await;
        count
    }

    /// Samples memory use and evicts proportionally to the pressure level,
    /// lowest `(priority, last_used_at)` first.
    pub async fn check_memory_pressure(&self) -> PressureReport {
        let level = match self.probe.used_memory_mb() {
            Some(used) => self.limits.memory.classify(used),
            None => PressureLevel::Low,
        };
        *lock(&self.last_pressure) = level;

        if level == PressureLevel::Low {
            return PressureReport {
                level,
                evicted: 0,
                caches_cleared: 0,
            };
        }

        self.counters.pressure_events.fetch_add(1, Ordering::Relaxed);

        let victims = {
            let mut resources = lock(&self.resources);
            let count = (resources.len() * level.eviction_percent()).div_ceil(100);
            let mut ranked: Vec<_> = resources
                .values()
                .map(|r| (r.priority, r.last_used_at, r.id))
                .collect();
            ranked.sort();
            ranked
                .into_iter()
                .take(count)
                .filter_map(|(_, _, id)| resources.remove(&id))
                .collect::<Vec<_>>()
        };
        let evicted = victims.len();
        tracing::warn!(
            "Memory pressure {:?}: evicting {} resources",
            level,
            evicted
        );
        self.release_all(victims, EvictionReason::Pressure(level)).await;

        let mut caches_cleared = 0;
        if level >= PressureLevel::High {
            // No collector to nudge; dropping cache contents is the reclaim.
            self.counters.reclaim_hints.fetch_add(1, Ordering::Relaxed);
            let caches = lock(&self.caches).clone();
            for cache in caches {
                cache.clear();
                caches_cleared += 1;
                tracing::debug!("Cleared cache '{}' under {:?} pressure", cache.name(), level);
            }
        }

        PressureReport {
            level,
            evicted,
            caches_cleared,
        }
    }

    /// Spawns the periodic expiry sweep and memory-pressure probe. Both stop
    /// on [`shutdown`](Self::shutdown) or when the manager is dropped.
    pub fn start(self: &Arc<Self>) {
        let sweep = Self::spawn_periodic(
            Arc::downgrade(self),
            self.limits.sweep_interval,
            self.cancel.clone(),
            |manager| async move {
                manager.sweep_expired().await;
            },
        );
        let pressure = Self::spawn_periodic(
            Arc::downgrade(self),
            self.limits.pressure_interval,
            self.cancel.clone(),
            |manager| async move {
                manager.check_memory_pressure().await;
            },
        );
        lock(&self.tasks).extend([sweep, pressure]);
    }

    fn spawn_periodic<F, Fut>(
        manager: Weak<Self>,
        period: Duration,
        cancel: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                tick(manager).await;
            }
        })
    }

    /// The single shutdown hook. Stops the periodic tasks and releases every
    /// remaining resource, giving up after `timeout`. Later calls are no-ops.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::debug!("Periodic task ended abnormally: {}", e);
            }
        }

        let remaining: Vec<_> = lock(&self.resources).drain().map(|(_, r)| r).collect();
        let count = remaining.len();
        tracing::info!("Shutting down resource manager, releasing {} resources", count);

        let cleaned_before = self.counters.cleaned.load(Ordering::SeqCst);
        if tokio::time::timeout(timeout, self.release_all(remaining, EvictionReason::Shutdown))
            .await
            .is_err()
        {
            let finished = self.counters.cleaned.load(Ordering::SeqCst) - cleaned_before;
            let abandoned = (count as u64).saturating_sub(finished);
            self.counters.abandoned.fetch_add(abandoned, Ordering::SeqCst);
            self.counters.cleaned.fetch_add(abandoned, Ordering::SeqCst);
            tracing::warn!(
                "Resource drain exceeded {:?}; abandoned {} unfinished releases",
                timeout,
                abandoned
            );
        }
        count
    }

    pub fn stats(&self) -> ResourceStats {
        let mut by_kind = HashMap::new();
        let active = {
            let resources = lock(&self.resources);
            for resource in resources.values() {
                *by_kind.entry(resource.kind).or_insert(0) += 1;
            }
            resources.len()
        };

        ResourceStats {
            created: self.counters.created.load(Ordering::Relaxed),
            cleaned: self.counters.cleaned.load(Ordering::Relaxed),
            release_failures: self.counters.release_failures.load(Ordering::Relaxed),
            sweep_runs: self.counters.sweep_runs.load(Ordering::Relaxed),
            pressure_events: self.counters.pressure_events.load(Ordering::Relaxed),
            reclaim_hints: self.counters.reclaim_hints.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            active,
            by_kind,
            last_pressure: *lock(&self.last_pressure),
        }
    }

    async fn enforce_ceiling(&self) {
        let victims = {
            let mut resources = lock(&self.resources);
            let len = resources.len();
            if len <= self.limits.max_resource_count {
                return;
            }
            let count = len.div_ceil(10);
            let mut ranked: Vec<_> = resources
                .values()
                .map(|r| (r.last_used_at, r.id))
                .collect();
            ranked.sort();
            ranked
                .into_iter()
                .take(count)
                .filter_map(|(_, id)| resources.remove(&id))
                .collect::<Vec<_>>()
        };

        let exhausted = MonitorError::ResourceExhausted {
            message: format!(
                "more than {} resources tracked",
                self.limits.max_resource_count
            ),
        };
        tracing::warn!("{}; evicting {} least recently used", exhausted, victims.len());
        self.release_all(victims, EvictionReason::Ceiling).await;
    }

    fn take_where<P>(&self, predicate: P) -> Vec<TrackedResource>
    where
        P: Fn(&TrackedResource) -> bool,
    {
        let mut resources = lock(&self.resources);
        let ids: Vec<_> = resources
            .values()
            .filter(|r| predicate(r))
            .map(|r| r.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| resources.remove(&id))
            .collect()
    }

    /// Runs release callbacks concurrently. Failures are logged and counted.
    async fn release_all(&self, victims: Vec<TrackedResource>, reason: EvictionReason) {
        let releases = victims.into_iter().map(|resource| {
            let TrackedResource { id, kind, release, .. } = resource;
            async move {
                let outcome = release().await;
                self.counters.cleaned.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = outcome {
                    self.counters.release_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Release of {} ({:?}, {:?}) failed: {}", id, kind, reason, e);
                }
            }
        });
        join_all(releases).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::TtlCache;
    use std::sync::atomic::AtomicU32;

    struct FixedProbe(AtomicU64);

    impl FixedProbe {
        fn new(mb: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(mb)))
        }
    }

    impl MemoryProbe for FixedProbe {
        fn used_memory_mb(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    fn limits(max_resource_count: usize) -> ResourceLimits {
        ResourceLimits {
            max_age: Duration::from_secs(600),
            max_idle: Duration::from_secs(60),
            max_resource_count,
            sweep_interval: Duration::from_secs(10),
            pressure_interval: Duration::from_secs(10),
            memory: MemoryThresholds {
                medium_mb: 100,
                high_mb: 200,
                critical_mb: 300,
            },
        }
    }

    fn manager(max: usize, probe_mb: u64) -> ResourceManager {
        ResourceManager::new(limits(max), FixedProbe::new(probe_mb))
    }

    async fn register_counted(
        manager: &ResourceManager,
        priority: i32,
        calls: Arc<AtomicU32>,
    ) -> ResourceId {
        manager
            .register(ResourceKind::FetchChannel, priority, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_threshold_classification() {
        let thresholds = limits(1).memory;
        assert_eq!(thresholds.classify(50), PressureLevel::Low);
        assert_eq!(thresholds.classify(100), PressureLevel::Medium);
        assert_eq!(thresholds.classify(250), PressureLevel::High);
        assert_eq!(thresholds.classify(900), PressureLevel::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_evicts_oldest_and_releases_each_once() {
        let manager = manager(500, 0);
        let calls: Vec<Arc<AtomicU32>> = (0..1000).map(|_| Arc::new(AtomicU32::new(0))).collect();
        let mut ids = Vec::new();

        for (i, counter) in calls.iter().enumerate() {
            ids.push(register_counted(&manager, 0, counter.clone()).await);
            if i == 500 {
                // the 501st registration crosses the ceiling
                let released = calls.iter().filter(|c| c.load(Ordering::SeqCst) == 1).count();
                assert!(released >= 50);
                // oldest go first
                assert_eq!(calls[0].load(Ordering::SeqCst), 1);
                assert_eq!(calls[500].load(Ordering::SeqCst), 0);
            }
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        let stats = manager.stats();
        assert!(stats.active <= 500);
        assert_eq!(stats.created, 1000);
        assert_eq!(stats.cleaned as usize + stats.active, 1000);

        for (counter, id) in calls.iter().zip(&ids) {
            let expected = if manager.is_tracked(*id) { 0 } else { 1 };
            assert_eq!(counter.load(Ordering::SeqCst), expected);
        }

        manager.shutdown(Duration::from_secs(5)).await;
        assert!(calls.iter().all(|c| c.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_pressure_evicts_by_priority_then_recency() {
        let manager = manager(1000, 350);
        let mut tracked = Vec::new();

        // priority 0..4, two resources each, the second used more recently
        for priority in 0..5 {
            for _ in 0..2 {
                let calls = Arc::new(AtomicU32::new(0));
                let id = register_counted(&manager, priority, calls.clone()).await;
                tracked.push((priority, id, calls));
                tokio::time::advance(Duration::from_millis(10)).await;
            }
        }

        let report = manager.check_memory_pressure().await;

        assert_eq!(report.level, PressureLevel::Critical);
        assert_eq!(report.evicted, 8);
        // the two highest-priority resources survive
        for (priority, id, calls) in &tracked {
            let survived = manager.is_tracked(*id);
            assert_eq!(survived, *priority == 4);
            assert_eq!(calls.load(Ordering::SeqCst), if survived { 0 } else { 1 });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_pressure_evicts_least_recently_used_fifth() {
        let manager = manager(1000, 150);
        let mut ids = Vec::new();
        for _ in 0..10 {
            ids.push(register_counted(&manager, 0, Arc::new(AtomicU32::new(0))).await);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        // refresh the oldest so it is no longer least recently used
        assert!(manager.touch(ids[0]));

        let report = manager.check_memory_pressure().await;

        assert_eq!(report.level, PressureLevel::Medium);
        assert_eq!(report.evicted, 2);
        assert!(manager.is_tracked(ids[0]));
        assert!(!manager.is_tracked(ids[1]));
        assert!(!manager.is_tracked(ids[2]));
        assert_eq!(report.caches_cleared, 0);
    }

    #[tokio::test]
    async fn test_high_pressure_clears_registered_caches() {
        let manager = manager(1000, 250);
        let cache: Arc<TtlCache<String, u32>> = Arc::new(TtlCache::new("pages"));
        cache.set("a".to_string(), 1, Duration::from_secs(60));
        manager.register_cache(cache.clone());

        let report = manager.check_memory_pressure().await;

        assert_eq!(report.level, PressureLevel::High);
        assert_eq!(report.caches_cleared, 1);
        assert_eq!(cache.stats().size, 0);
        let stats = manager.stats();
        assert_eq!(stats.pressure_events, 1);
        assert_eq!(stats.reclaim_hints, 1);
        assert_eq!(stats.last_pressure, PressureLevel::High);
    }

    #[tokio::test]
    async fn test_low_pressure_evicts_nothing() {
        let manager = manager(1000, 10);
        register_counted(&manager, 0, Arc::new(AtomicU32::new(0))).await;

        let report = manager.check_memory_pressure().await;

        assert_eq!(report.level, PressureLevel::Low);
        assert_eq!(report.evicted, 0);
        assert_eq!(manager.stats().pressure_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_and_aged_resources() {
        let manager = manager(1000, 0);
        let idle = register_counted(&manager, 0, Arc::new(AtomicU32::new(0))).await;
        let busy = register_counted(&manager, 0, Arc::new(AtomicU32::new(0))).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        manager.touch(busy);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(manager.sweep_expired().await, 1);
        assert!(!manager.is_tracked(idle));
        assert!(manager.is_tracked(busy));

        // keep touching until max_age is exceeded
        for _ in 0..12 {
            tokio::time::advance(Duration::from_secs(50)).await;
            manager.touch(busy);
        }
        assert_eq!(manager.sweep_expired().await, 1);
        assert!(!manager.is_tracked(busy));
        assert_eq!(manager.stats().sweep_runs, 2);
    }

    #[tokio::test]
    async fn test_failing_release_is_counted_and_untracked() {
        let manager = manager(1000, 0);
        let id = manager
            .register(ResourceKind::HttpClient, 0, || async {
                Err(MonitorError::IoError(std::io::Error::other("client gone")))
            })
            .await
            .unwrap();

        assert!(manager.release(id).await.is_err());
        assert!(!manager.is_tracked(id));
        assert!(!manager.release(id).await.unwrap());

        let stats = manager.stats();
        assert_eq!(stats.release_failures, 1);
        assert_eq!(stats.cleaned, 1);
    }

    #[tokio::test]
    async fn test_manual_release_then_shutdown_releases_once() {
        let manager = manager(1000, 0);
        let calls = Arc::new(AtomicU32::new(0));
        let id = register_counted(&manager, 0, calls.clone()).await;

        assert!(manager.release(id).await.unwrap());
        manager.shutdown(Duration::from_secs(1)).await;
        manager.shutdown(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_after_shutdown_releases_immediately() {
        let manager = manager(1000, 0);
        manager.shutdown(Duration::from_secs(1)).await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = manager
            .register(ResourceKind::Other, 0, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(MonitorError::Shutdown)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_group_active_by_kind() {
        let manager = manager(1000, 0);
        for kind in [
            ResourceKind::FetchChannel,
            ResourceKind::FetchChannel,
            ResourceKind::HttpClient,
        ] {
            manager.register(kind, 0, || async { Ok(()) }).await.unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.active, 3);
        assert_eq!(stats.by_kind.get(&ResourceKind::FetchChannel), Some(&2));
        assert_eq!(stats.by_kind.get(&ResourceKind::HttpClient), Some(&1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_racing_shutdown_releases_everything() {
        let manager = Arc::new(manager(1000, 0));
        let calls = Arc::new(AtomicU32::new(0));

        let registrations: Vec<_> = (0..64)
            .map(|_| {
                let manager = manager.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    manager
                        .register(ResourceKind::FetchChannel, 0, move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        manager.shutdown(Duration::from_secs(5)).await;

        for registration in registrations {
            let _ = registration.await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 64);
        assert_eq!(manager.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_timeout_counts_abandoned_releases() {
        let manager = manager(1000, 0);
        register_counted(&manager, 0, Arc::new(AtomicU32::new(0))).await;
        manager
            .register(ResourceKind::FetchChannel, 0, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(manager.shutdown(Duration::from_secs(1)).await, 2);

        let stats = manager.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.created, stats.cleaned + stats.active as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_runs_until_shutdown() {
        let manager = Arc::new(manager(1000, 0));
        let calls = Arc::new(AtomicU32::new(0));
        register_counted(&manager, 0, calls.clone()).await;
        manager.start();

        // idle limit is 60s, sweep interval 10s
        tokio::time::sleep(Duration::from_secs(75)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(manager.stats().sweep_runs >= 6);

        manager.shutdown(Duration::from_secs(1)).await;
        let runs = manager.stats().sweep_runs;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(manager.stats().sweep_runs, runs);
    }
}
