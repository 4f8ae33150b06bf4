use crate::domain::ports::Notifier;
use crate::utils::error::{MonitorError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

/// Posts `{"text": message}` to a chat webhook (Slack, Discord-compatible,
/// Mattermost, ...).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .map_err(|e| MonitorError::NotificationError {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MonitorError::NotificationError {
                message: format!("webhook returned {}: {}", status, body.trim()),
            });
        }
        Ok(())
    }
}

/// Writes notifications to the log instead of sending them. Used for dry runs
/// and when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        tracing::info!("🔔 {}", message.replace('\n', " "));
        Ok(())
    }
}
