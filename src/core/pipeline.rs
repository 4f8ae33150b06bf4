//! One monitoring pass over all targets: check pages in batches, compare with
//! the last known state, notify on restock, persist.

use crate::core::batch::{BatchConfig, BatchScheduler};
use crate::core::cache::{TtlCache, WarmupItem, WarmupReport};
use crate::core::channels::ChannelPool;
use crate::core::resources::ResourceManager;
use crate::core::retry::{RetryExecutor, RetryPolicy};
use crate::core::state_store::StateStore;
use crate::domain::model::{
    ErrorMarker, MonitorTarget, Observation, PersistedState, RunReport, StockStatus, TargetRecord,
};
use crate::domain::ports::{Classifier, Notifier, PageFetcher, Pipeline};
use crate::utils::error::{MonitorError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub type PageCache = TtlCache<String, Observation>;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    /// Fetch every uncached target up front, before the batched pass.
    pub warmup: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(30),
            warmup: false,
        }
    }
}

/// The collaborators a pipeline is built from.
pub struct PipelineParts {
    pub fetcher: Arc<dyn PageFetcher>,
    pub classifier: Arc<dyn Classifier>,
    pub notifier: Arc<dyn Notifier>,
    pub resources: Arc<ResourceManager>,
    pub store: Arc<StateStore<PersistedState>>,
}

struct TargetCheck {
    observation: Observation,
    from_cache: bool,
}

pub struct MonitorPipeline {
    targets: Vec<MonitorTarget>,
    settings: PipelineSettings,
    cache: Arc<PageCache>,
    channels: ChannelPool,
    classifier: Arc<dyn Classifier>,
    notifier: Arc<dyn Notifier>,
    resources: Arc<ResourceManager>,
    store: Arc<StateStore<PersistedState>>,
    retry: RetryExecutor,
    scheduler: BatchScheduler,
}

impl MonitorPipeline {
    pub fn new(targets: Vec<MonitorTarget>, parts: PipelineParts, settings: PipelineSettings) -> Self {
        let cache = Arc::new(PageCache::new("pages"));
        parts.resources.register_cache(cache.clone());

        Self {
            targets,
            settings,
            cache,
            channels: ChannelPool::new(parts.fetcher, parts.resources.clone()),
            classifier: parts.classifier,
            notifier: parts.notifier,
            resources: parts.resources,
            store: parts.store,
            retry: RetryExecutor::new(RetryPolicy::default()),
            scheduler: BatchScheduler::new(BatchConfig::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batching(mut self, config: BatchConfig) -> Self {
        self.scheduler = BatchScheduler::new(config);
        self
    }

    pub fn targets(&self) -> &[MonitorTarget] {
        &self.targets
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn store(&self) -> &Arc<StateStore<PersistedState>> {
        &self.store
    }

    /// Fetches every uncached target, at most `batch.concurrency` at a time.
    pub async fn warm_cache(&self) -> WarmupReport<String> {
        let items: Vec<WarmupItem<'_, String, Observation>> = self
            .targets
            .iter()
            .filter(|target| !self.cache.contains(&target.cache_key))
            .map(|target| {
                WarmupItem::new(
                    target.cache_key.clone(),
                    self.settings.cache_ttl,
                    self.observe(target),
                )
            })
            .collect();
        self.cache
            .warmup(items, self.scheduler.config().concurrency)
            .await
    }

    async fn check(&self, target: &MonitorTarget) -> Result<TargetCheck> {
        if let Some(observation) = self.cache.get(&target.cache_key) {
            tracing::debug!("Cache hit for {}", target.url);
            return Ok(TargetCheck {
                observation,
                from_cache: true,
            });
        }

        let observation = self.observe(target).await?;
        self.cache.set(
            target.cache_key.clone(),
            observation.clone(),
            self.settings.cache_ttl,
        );
        Ok(TargetCheck {
            observation,
            from_cache: false,
        })
    }

    /// Fetches through a pooled channel with retries, then classifies.
    async fn observe(&self, target: &MonitorTarget) -> Result<Observation> {
        let timeout = self.settings.fetch_timeout;
        let content = self
            .retry
            .execute(|attempt| async move {
                if attempt > 1 {
                    tracing::debug!("Retrying {} (attempt {})", target.url, attempt);
                }
                let lease = self.channels.acquire().await?;
                match lease.fetch(&target.url, timeout).await {
                    Ok(content) => Ok(content),
                    Err(e) => {
                        if e.is_retryable() {
                            lease.discard().await;
                        }
                        Err(e)
                    }
                }
            })
            .await?;

        let classification = self.classifier.classify(&content, &target.url);
        tracing::debug!(
            "{} classified as {}",
            target.url,
            if classification.in_stock { "in stock" } else { "out of stock" }
        );
        Ok(Observation {
            classification,
            checked_at: Utc::now(),
        })
    }

    async fn apply(&self, target: &MonitorTarget, observation: &Observation, report: &mut RunReport) {
        let classification = &observation.classification;
        let previous = self
            .store
            .read(|state| target.last_known_state(state).map(|status| status.in_stock));

        if let Some(note) = &classification.confidence_note {
            tracing::debug!("{}: {}", target.url, note);
        }

        let mut notified_at = None;
        if classification.in_stock && previous != Some(true) {
            let message = alert_message(target, observation);
            match self.notifier.notify(&message).await {
                Ok(()) => {
                    tracing::info!("{} is in stock, notification sent", target.display_name());
                    report.notified += 1;
                    notified_at = Some(Utc::now());
                }
                Err(e) => {
                    tracing::warn!("Notification for {} failed: {}", target.url, e);
                    report.notify_failures += 1;
                }
            }
        } else if !classification.in_stock && previous == Some(true) {
            tracing::info!("{} went out of stock", target.display_name());
        }

        self.store.update(|state| {
            let record = state
                .entry(target.cache_key.clone())
                .or_insert_with(|| TargetRecord::new(&target.url));
            record.status = Some(StockStatus {
                in_stock: classification.in_stock,
                title: classification.title.clone(),
                price: classification.price.clone(),
                checked_at: observation.checked_at,
            });
            record.last_error = None;
            if notified_at.is_some() {
                record.last_notified_at = notified_at;
            }
        });
    }

    /// Keeps the last known status untouched and only records the failure.
    fn record_failure(&self, target: &MonitorTarget, error: &MonitorError) {
        tracing::warn!("{}", error.user_friendly_message());
        self.store.update(|state| {
            let record = state
                .entry(target.cache_key.clone())
                .or_insert_with(|| TargetRecord::new(&target.url));
            let consecutive_failures = record
                .last_error
                .as_ref()
                .map_or(0, |marker| marker.consecutive_failures)
                + 1;
            record.last_error = Some(ErrorMarker {
                message: error.to_string(),
                at: Utc::now(),
                consecutive_failures,
            });
        });
    }
}

#[async_trait]
impl Pipeline for MonitorPipeline {
    async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        tracing::info!("Checking {} targets", self.targets.len());

        // Targets that already exhausted their retries during warmup are not
        // fetched again in the same run.
        let mut warmup_failures = HashMap::new();
        if self.settings.warmup {
            let warmed = self.warm_cache().await;
            tracing::debug!("Warmup loaded {}, failed {}", warmed.loaded, warmed.failed());
            warmup_failures.extend(warmed.failures);
        }
        let warmup_failures = Mutex::new(warmup_failures);

        let targets: Vec<&MonitorTarget> = self.targets.iter().collect();
        let outcomes = self
            .scheduler
            .run(targets, |target| {
                let failed = warmup_failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&target.cache_key);
                async move {
                    match failed {
                        Some(e) => Err(e),
                        None => self.check(target).await,
                    }
                }
            })
            .await;

        let mut report = RunReport::default();
        for (target, outcome) in self.targets.iter().zip(outcomes) {
            report.checked += 1;
            match outcome {
                Ok(check) => {
                    if check.from_cache {
                        report.cached += 1;
                    }
                    self.apply(target, &check.observation, &mut report).await;
                }
                Err(e) => {
                    report.errored += 1;
                    self.record_failure(target, &e);
                }
            }
        }

        report.state_saved = match self.store.save() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to persist state: {}", e);
                false
            }
        };
        report.duration = started.elapsed();

        tracing::info!(
            "Run finished in {:?}: {} checked, {} cached, {} errored, {} notified",
            report.duration,
            report.checked,
            report.cached,
            report.errored,
            report.notified
        );
        Ok(report)
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let released = self.resources.shutdown(timeout).await;
        tracing::debug!("Released {} resources on shutdown", released);
        self.store.close().await
    }
}

pub fn alert_message(target: &MonitorTarget, observation: &Observation) -> String {
    let classification = &observation.classification;
    let title = match classification.title.trim() {
        "" => target.display_name(),
        title => title,
    };

    let mut message = format!("Back in stock: {}", title);
    if let Some(price) = &classification.price {
        message.push_str(&format!(" ({})", price));
    }
    message.push('\n');
    message.push_str(&target.url);
    message
}
