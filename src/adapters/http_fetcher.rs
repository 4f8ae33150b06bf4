use crate::core::resources::ResourceKind;
use crate::domain::ports::{FetchChannel, PageFetcher};
use crate::utils::error::{MonitorError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("restock-monitor/", env!("CARGO_PKG_VERSION"));

/// Opens one reqwest client per channel, so each channel owns its own
/// connection pool and closing it drops those connections.
pub struct HttpFetcher {
    user_agent: String,
    connect_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(user_agent: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            user_agent: user_agent.into(),
            connect_timeout,
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_USER_AGENT, Duration::from_secs(10))
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn open_channel(&self) -> Result<Arc<dyn FetchChannel>> {
        let client = Client::builder()
            .user_agent(self.user_agent.as_str())
            .connect_timeout(self.connect_timeout)
            .build()?;
        Ok(Arc::new(HttpChannel {
            client,
            closed: AtomicBool::new(false),
        }))
    }

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::HttpClient
    }
}

pub struct HttpChannel {
    client: Client,
    closed: AtomicBool,
}

#[async_trait]
impl FetchChannel for HttpChannel {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MonitorError::IoError(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "fetch channel already closed",
            )));
        }

        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MonitorError::Timeout { after: timeout }
                } else {
                    MonitorError::RequestError(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(response.text().await?)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
