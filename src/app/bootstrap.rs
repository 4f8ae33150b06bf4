use crate::adapters::{HttpFetcher, KeywordClassifier, LogNotifier, WebhookNotifier};
use crate::adapters::http_fetcher::DEFAULT_USER_AGENT;
use crate::config::TomlConfig;
use crate::core::pipeline::{MonitorPipeline, PipelineParts};
use crate::core::resources::{MemoryProbe, ResourceManager};
use crate::core::retry::RetryExecutor;
use crate::core::state_store::StateStore;
use crate::domain::model::PersistedState;
use crate::domain::ports::Notifier;
use crate::utils::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Wires the default adapters from a validated config. Must be called inside
/// a tokio runtime: the resource manager's sweeps and the state store's flush
/// task are spawned here.
pub fn build_pipeline(
    config: &TomlConfig,
    probe: Arc<dyn MemoryProbe>,
    cancel: CancellationToken,
) -> Result<MonitorPipeline> {
    let targets = config.monitor_targets()?;

    let resources = Arc::new(ResourceManager::new(config.resource_limits(), probe));
    resources.start();

    let store = Arc::new(StateStore::open(
        config.state_path(),
        PersistedState::new(),
        config.state_debounce(),
    ));

    let fetcher = HttpFetcher::new(
        config.user_agent().unwrap_or(DEFAULT_USER_AGENT),
        Duration::from_secs(10),
    );
    let classifier = KeywordClassifier::new(config.keyword_rules())?;
    let notifier: Arc<dyn Notifier> = match config.webhook_url() {
        Some(url) => Arc::new(WebhookNotifier::new(url, config.notifier_timeout())?),
        None => {
            tracing::info!("No webhook configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };

    tracing::debug!(
        "Built pipeline '{}' for {} targets, state at {}",
        config.name(),
        targets.len(),
        config.state_path()
    );

    Ok(MonitorPipeline::new(
        targets,
        PipelineParts {
            fetcher: Arc::new(fetcher),
            classifier: Arc::new(classifier),
            notifier,
            resources,
            store,
        },
        config.pipeline_settings(),
    )
    .with_retry(RetryExecutor::new(config.retry_policy()).with_cancellation(cancel))
    .with_batching(config.batch_config()))
}
