use crate::adapters::keyword_classifier::{AmbiguityPolicy, KeywordRules};
use crate::core::batch::BatchConfig;
use crate::core::pipeline::PipelineSettings;
use crate::core::resources::{MemoryThresholds, ResourceLimits};
use crate::core::retry::RetryPolicy;
use crate::domain::model::MonitorTarget;
use crate::utils::error::{MonitorError, Result};
use crate::utils::validation::{self, Validate};
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_STATE_PATH: &str = "./state/stock_state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    pub monitor: MonitorConfig,
    pub targets: Vec<TargetConfig>,
    pub batch: Option<BatchingConfig>,
    pub cache: Option<CacheConfig>,
    pub retry: Option<RetryConfig>,
    pub resources: Option<ResourcesConfig>,
    pub state: Option<StateConfig>,
    pub notifier: Option<NotifierConfig>,
    pub classifier: Option<ClassifierConfig>,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub name: String,
    pub interval_seconds: Option<u64>,
    pub user_agent: Option<String>,
    pub shutdown_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url: String,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    pub size: Option<usize>,
    pub concurrency: Option<usize>,
    pub inter_batch_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_seconds: Option<u64>,
    pub warmup: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub fetch_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub max_age_seconds: Option<u64>,
    pub max_idle_seconds: Option<u64>,
    pub max_count: Option<usize>,
    pub sweep_interval_seconds: Option<u64>,
    pub pressure_interval_seconds: Option<u64>,
    pub memory: Option<MemoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub medium_mb: Option<u64>,
    pub high_mb: Option<u64>,
    pub critical_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub path: Option<String>,
    pub debounce_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// "webhook" or "log"
    pub r#type: String,
    pub url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub ambiguity: Option<AmbiguityPolicy>,
    pub in_stock_patterns: Option<Vec<String>>,
    pub out_of_stock_patterns: Option<Vec<String>>,
    pub force_in_stock: Option<Vec<String>>,
    pub force_out_of_stock: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    /// "compact" or "json"
    pub log_format: Option<String>,
}

impl TomlConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(MonitorError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| MonitorError::ConfigError {
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// Replaces `${VAR}` with the environment value. Unset variables are left
    /// as-is so validation reports them.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").map_err(|e| {
            MonitorError::ConfigError {
                message: format!("env substitution pattern: {}", e),
            }
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });
        Ok(result.into_owned())
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_string("monitor.name", &self.monitor.name)?;

        if self.targets.is_empty() {
            return Err(MonitorError::MissingConfigError {
                field: "targets".to_string(),
            });
        }
        for target in &self.targets {
            validation::validate_url("targets.url", &target.url)?;
        }
        let keys = self.monitor_targets()?;
        validation::validate_unique("targets.url", keys.iter().map(|t| t.cache_key.as_str()))?;

        if let Some(interval) = self.monitor.interval_seconds {
            validation::validate_positive_number("monitor.interval_seconds", interval as usize, 1)?;
        }

        let batch = self.batch_config();
        validation::validate_range("batch.size", batch.batch_size, 1, 100)?;
        validation::validate_range("batch.concurrency", batch.concurrency, 1, 64)?;

        validation::validate_range("retry.max_retries", self.retry_policy().max_retries, 0, 10)?;
        validation::validate_positive_number(
            "retry.fetch_timeout_ms",
            self.pipeline_settings().fetch_timeout.as_millis() as usize,
            1,
        )?;

        let limits = self.resource_limits();
        validation::validate_positive_number("resources.max_count", limits.max_resource_count, 1)?;
        validation::validate_positive_number(
            "resources.sweep_interval_seconds",
            limits.sweep_interval.as_secs() as usize,
            1,
        )?;
        validation::validate_positive_number(
            "resources.pressure_interval_seconds",
            limits.pressure_interval.as_secs() as usize,
            1,
        )?;
        validation::validate_ascending(
            "resources.memory",
            &[
                limits.memory.medium_mb,
                limits.memory.high_mb,
                limits.memory.critical_mb,
            ],
        )?;

        validation::validate_path("state.path", self.state_path())?;

        if let Some(notifier) = &self.notifier {
            match notifier.r#type.as_str() {
                "webhook" => {
                    let url = validation::validate_required_field("notifier.url", &notifier.url)?;
                    validation::validate_url("notifier.url", url)?;
                }
                "log" => {}
                other => {
                    return Err(MonitorError::InvalidConfigValueError {
                        field: "notifier.type".to_string(),
                        value: other.to_string(),
                        reason: "Unsupported notifier. Valid types: webhook, log".to_string(),
                    })
                }
            }
        }

        let rules = self.keyword_rules();
        for (field, patterns) in [
            ("classifier.in_stock_patterns", &rules.in_stock),
            ("classifier.out_of_stock_patterns", &rules.out_of_stock),
        ] {
            RegexSet::new(patterns).map_err(|e| MonitorError::InvalidConfigValueError {
                field: field.to_string(),
                value: patterns.join(", "),
                reason: e.to_string(),
            })?;
        }

        if let Some(format) = self.monitoring.as_ref().and_then(|m| m.log_format.as_deref()) {
            if !["compact", "json"].contains(&format) {
                return Err(MonitorError::InvalidConfigValueError {
                    field: "monitoring.log_format".to_string(),
                    value: format.to_string(),
                    reason: "Valid formats: compact, json".to_string(),
                });
            }
        }

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.monitor.name
    }

    pub fn monitor_targets(&self) -> Result<Vec<MonitorTarget>> {
        self.targets
            .iter()
            .map(|target| {
                let monitor_target = MonitorTarget::new(&target.url)?;
                Ok(match &target.label {
                    Some(label) => monitor_target.with_label(label.clone()),
                    None => monitor_target,
                })
            })
            .collect()
    }

    /// Interval between runs in watch mode.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_seconds.unwrap_or(300))
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.monitor.user_agent.as_deref()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.shutdown_timeout_seconds.unwrap_or(10))
    }

    pub fn batch_config(&self) -> BatchConfig {
        let defaults = BatchConfig::default();
        match &self.batch {
            Some(batch) => BatchConfig {
                batch_size: batch.size.unwrap_or(defaults.batch_size),
                concurrency: batch.concurrency.unwrap_or(defaults.concurrency),
                inter_batch_delay: batch
                    .inter_batch_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.inter_batch_delay),
            },
            None => defaults,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        match &self.retry {
            Some(retry) => RetryPolicy {
                max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
                base_delay: retry
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.base_delay),
                max_delay: retry.max_delay_ms.map(Duration::from_millis).or(defaults.max_delay),
                attempt_timeout: retry
                    .fetch_timeout_ms
                    .map(Duration::from_millis)
                    .or(defaults.attempt_timeout),
            },
            None => defaults,
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        let defaults = ResourceLimits::default();
        let Some(resources) = &self.resources else {
            return defaults;
        };
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };

        let memory = match &resources.memory {
            Some(memory) => MemoryThresholds {
                medium_mb: memory.medium_mb.unwrap_or(defaults.memory.medium_mb),
                high_mb: memory.high_mb.unwrap_or(defaults.memory.high_mb),
                critical_mb: memory.critical_mb.unwrap_or(defaults.memory.critical_mb),
            },
            None => defaults.memory,
        };

        ResourceLimits {
            max_age: secs(resources.max_age_seconds, defaults.max_age),
            max_idle: secs(resources.max_idle_seconds, defaults.max_idle),
            max_resource_count: resources.max_count.unwrap_or(defaults.max_resource_count),
            sweep_interval: secs(resources.sweep_interval_seconds, defaults.sweep_interval),
            pressure_interval: secs(
                resources.pressure_interval_seconds,
                defaults.pressure_interval,
            ),
            memory,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let defaults = PipelineSettings::default();
        PipelineSettings {
            cache_ttl: self
                .cache
                .as_ref()
                .and_then(|c| c.ttl_seconds)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            fetch_timeout: self
                .retry
                .as_ref()
                .and_then(|r| r.fetch_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_timeout),
            warmup: self
                .cache
                .as_ref()
                .and_then(|c| c.warmup)
                .unwrap_or(defaults.warmup),
        }
    }

    pub fn state_path(&self) -> &str {
        self.state
            .as_ref()
            .and_then(|s| s.path.as_deref())
            .unwrap_or(DEFAULT_STATE_PATH)
    }

    pub fn state_debounce(&self) -> Duration {
        Duration::from_millis(self.state.as_ref().and_then(|s| s.debounce_ms).unwrap_or(500))
    }

    /// Webhook URL, or `None` when notifications only go to the log.
    pub fn webhook_url(&self) -> Option<&str> {
        self.notifier
            .as_ref()
            .filter(|n| n.r#type == "webhook")
            .and_then(|n| n.url.as_deref())
    }

    pub fn notifier_timeout(&self) -> Duration {
        Duration::from_secs(
            self.notifier
                .as_ref()
                .and_then(|n| n.timeout_seconds)
                .unwrap_or(10),
        )
    }

    pub fn keyword_rules(&self) -> KeywordRules {
        let defaults = KeywordRules::with_defaults();
        let Some(classifier) = &self.classifier else {
            return defaults;
        };
        KeywordRules {
            in_stock: classifier.in_stock_patterns.clone().unwrap_or(defaults.in_stock),
            out_of_stock: classifier
                .out_of_stock_patterns
                .clone()
                .unwrap_or(defaults.out_of_stock),
            ambiguity: classifier.ambiguity.unwrap_or_default(),
            force_in_stock: classifier.force_in_stock.clone().unwrap_or_default(),
            force_out_of_stock: classifier.force_out_of_stock.clone().unwrap_or_default(),
        }
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn json_logs(&self) -> bool {
        self.monitoring
            .as_ref()
            .and_then(|m| m.log_format.as_deref())
            .is_some_and(|f| f == "json")
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
