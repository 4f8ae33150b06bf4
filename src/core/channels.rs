//! Reusable fetch channels, each one tracked by the [`ResourceManager`].
//!
//! A channel that the manager has evicted (idle sweep, pressure, ceiling or
//! shutdown) is already closed; the pool notices through `touch` and opens a
//! fresh one instead of handing it out.

use crate::core::resources::{ResourceId, ResourceManager};
use crate::domain::ports::{FetchChannel, PageFetcher};
use crate::utils::error::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct IdleChannel {
    id: ResourceId,
    channel: Arc<dyn FetchChannel>,
}

pub struct ChannelPool {
    fetcher: Arc<dyn PageFetcher>,
    resources: Arc<ResourceManager>,
    idle: Mutex<Vec<IdleChannel>>,
}

/// Eviction priority for fetch channels; all channels rank equally and fall
/// back to least-recently-used order under memory pressure.
const CHANNEL_PRIORITY: i32 = 0;

impl ChannelPool {
    pub fn new(fetcher: Arc<dyn PageFetcher>, resources: Arc<ResourceManager>) -> Self {
        Self {
            fetcher,
            resources,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<IdleChannel>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    pub async fn acquire(&self) -> Result<ChannelLease<'_>> {
        loop {
            let candidate = self.idle().pop();
            match candidate {
                Some(idle) if self.resources.touch(idle.id) => {
                    tracing::trace!("Reusing channel {}", idle.id);
                    return Ok(ChannelLease {
                        pool: self,
                        id: idle.id,
                        channel: idle.channel,
                        discarded: false,
                    });
                }
                Some(idle) => tracing::trace!("Dropping evicted channel {}", idle.id),
                None => break,
            }
        }

        let channel = self.fetcher.open_channel().await?;
        let closer = channel.clone();
        let id = self
            .resources
            .register(self.fetcher.resource_kind(), CHANNEL_PRIORITY, move || async move {
                closer.close().await
            })
            .await?;
        tracing::debug!("Opened channel {}", id);

        Ok(ChannelLease {
            pool: self,
            id,
            channel,
            discarded: false,
        })
    }
}

/// A channel checked out of the pool. Dropping the lease returns the channel
/// for reuse unless it has been evicted meanwhile.
pub struct ChannelLease<'a> {
    pool: &'a ChannelPool,
    id: ResourceId,
    channel: Arc<dyn FetchChannel>,
    discarded: bool,
}

impl ChannelLease<'_> {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub async fn fetch(&self, url: &str, timeout: Duration) -> Result<String> {
        self.pool.resources.touch(self.id);
        self.channel.fetch(url, timeout).await
    }

    /// Closes the channel instead of returning it to the pool.
    pub async fn discard(mut self) {
        self.discarded = true;
        if let Err(e) = self.pool.resources.release(self.id).await {
            tracing::debug!("Closing channel {} failed: {}", self.id, e);
        }
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        if self.discarded || !self.pool.resources.is_tracked(self.id) {
            return;
        }
        self.pool.idle().push(IdleChannel {
            id: self.id,
            channel: self.channel.clone(),
        });
    }
}
