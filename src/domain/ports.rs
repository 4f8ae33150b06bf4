use crate::core::resources::ResourceKind;
use crate::domain::model::{Classification, RunReport};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether page content shows the product as available. Must be pure
/// and must not fail: unrecognisable content yields a best-effort guess.
pub trait Classifier: Send + Sync {
    fn classify(&self, content: &str, url: &str) -> Classification;
}

/// One open fetch handle, e.g. an HTTP client or a browser tab.
#[async_trait]
pub trait FetchChannel: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<String>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn FetchChannel>>;

    fn resource_kind(&self) -> ResourceKind {
        ResourceKind::FetchChannel
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self) -> Result<RunReport>;
    /// Drains tracked resources and flushes state. Called once at exit.
    async fn shutdown(&self, timeout: Duration) -> Result<()>;
}
