use crate::utils::error::{MonitorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

/// Classifier verdict for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub in_stock: bool,
    pub title: String,
    pub price: Option<String>,
    pub confidence_note: Option<String>,
}

/// A classification plus when the page was fetched. This is what the page
/// cache holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub classification: Classification,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonitorTarget {
    pub url: String,
    pub cache_key: String,
    pub label: Option<String>,
}

impl MonitorTarget {
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            cache_key: cache_key_for(url)?,
            label: None,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.url)
    }

    pub fn last_known_state<'a>(&self, state: &'a PersistedState) -> Option<&'a StockStatus> {
        state.get(&self.cache_key)?.status.as_ref()
    }
}

/// Stable identity for a product page: the parsed URL without its fragment.
/// Scheme and host are normalised by the parser.
pub fn cache_key_for(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url).map_err(|e| MonitorError::InvalidConfigValueError {
        field: "targets.url".to_string(),
        value: url.to_string(),
        reason: format!("Invalid URL format: {}", e),
    })?;
    parsed.set_fragment(None);
    Ok(format!("page:{}", parsed))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockStatus {
    pub in_stock: bool,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMarker {
    pub message: String,
    pub at: DateTime<Utc>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub url: String,
    #[serde(default)]
    pub status: Option<StockStatus>,
    #[serde(default)]
    pub last_error: Option<ErrorMarker>,
    #[serde(default)]
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl TargetRecord {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            status: None,
            last_error: None,
            last_notified_at: None,
        }
    }
}

/// Last known status per target, keyed by [`MonitorTarget::cache_key`].
pub type PersistedState = BTreeMap<String, TargetRecord>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub checked: usize,
    pub cached: usize,
    pub errored: usize,
    pub notified: usize,
    pub notify_failures: usize,
    pub state_saved: bool,
    #[serde(skip)]
    pub duration: Duration,
}

impl RunReport {
    /// True when there was at least one target and none succeeded.
    pub fn all_failed(&self) -> bool {
        self.checked > 0 && self.errored == self.checked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_drops_fragment_and_normalises_host() {
        let a = cache_key_for("https://Shop.Example.com/item/42#reviews").unwrap();
        let b = cache_key_for("https://shop.example.com/item/42").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "page:https://shop.example.com/item/42");
    }

    #[test]
    fn test_cache_key_keeps_query() {
        let a = cache_key_for("https://shop.example.com/item?sku=1").unwrap();
        let b = cache_key_for("https://shop.example.com/item?sku=2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_target_url_is_rejected() {
        assert!(MonitorTarget::new("not a url").is_err());
    }

    #[test]
    fn test_last_known_state_lookup() {
        let target = MonitorTarget::new("https://shop.example.com/a").unwrap();
        let mut state = PersistedState::new();
        assert!(target.last_known_state(&state).is_none());

        let mut record = TargetRecord::new(&target.url);
        record.status = Some(StockStatus {
            in_stock: false,
            title: "Widget".to_string(),
            price: None,
            checked_at: Utc::now(),
        });
        state.insert(target.cache_key.clone(), record);

        assert!(!target.last_known_state(&state).unwrap().in_stock);
    }

    #[test]
    fn test_record_deserializes_with_missing_optional_fields() {
        let record: TargetRecord =
            serde_json::from_str(r#"{"url": "https://shop.example.com/a"}"#).unwrap();
        assert!(record.status.is_none());
        assert!(record.last_error.is_none());
    }

    #[test]
    fn test_all_failed() {
        let mut report = RunReport {
            checked: 2,
            errored: 2,
            ..Default::default()
        };
        assert!(report.all_failed());
        report.errored = 1;
        assert!(!report.all_failed());
        assert!(!RunReport::default().all_failed());
    }
}
