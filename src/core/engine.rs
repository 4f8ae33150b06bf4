use crate::domain::model::RunReport;
use crate::domain::ports::Pipeline;
use crate::utils::error::Result;
use crate::utils::monitor::SystemMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives a [`Pipeline`] once or on a fixed interval, and owns the shutdown
/// hook.
pub struct MonitorEngine<P: Pipeline> {
    pipeline: P,
    monitor: Arc<SystemMonitor>,
    shutdown_timeout: Duration,
}

impl<P: Pipeline> MonitorEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self::with_monitor(pipeline, Arc::new(SystemMonitor::new(false)))
    }

    pub fn with_monitor(pipeline: P, monitor: Arc<SystemMonitor>) -> Self {
        Self {
            pipeline,
            monitor,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub async fn run_once(&self) -> Result<RunReport> {
        self.monitor.log_stats("Before run");
        let report = self.pipeline.run().await?;
        self.monitor.log_stats("After run");
        Ok(report)
    }

    /// Runs immediately and then every `interval` until `cancel` fires. A run
    /// in progress is allowed to finish. Returns the last completed report.
    pub async fn run_every(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Option<RunReport> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = None;
        let mut runs: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            runs += 1;
            tracing::debug!("Starting run #{}", runs);
            match self.run_once().await {
                Ok(report) => last = Some(report),
                Err(e) => tracing::error!("Run #{} failed: {}", runs, e),
            }
        }

        tracing::info!("Stopped after {} runs", runs);
        last
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down");
        let result = self.pipeline.shutdown(self.shutdown_timeout).await;
        self.monitor.log_final_stats();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::MonitorError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPipeline {
        runs: AtomicUsize,
        shutdowns: AtomicUsize,
        fail_every_other: bool,
    }

    #[async_trait]
    impl Pipeline for CountingPipeline {
        async fn run(&self) -> Result<RunReport> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every_other && n % 2 == 0 {
                return Err(MonitorError::PersistenceError {
                    path: "state.json".into(),
                    message: "disk full".to_string(),
                });
            }
            Ok(RunReport {
                checked: n,
                ..Default::default()
            })
        }

        async fn shutdown(&self, _timeout: Duration) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_once() {
        let engine = MonitorEngine::new(CountingPipeline::default());
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.checked, 1);
        engine.shutdown().await.unwrap();
        assert_eq!(engine.pipeline().shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_every_until_cancelled() {
        let engine = MonitorEngine::new(CountingPipeline::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.cancel();
        });

        let last = engine.run_every(Duration::from_secs(10), &cancel).await;

        // ticks at 0s, 10s and 20s
        assert_eq!(engine.pipeline().runs.load(Ordering::SeqCst), 3);
        assert_eq!(last.unwrap().checked, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_does_not_stop_the_loop() {
        let engine = MonitorEngine::new(CountingPipeline {
            fail_every_other: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let last = engine.run_every(Duration::from_secs(10), &cancel).await;

        assert_eq!(engine.pipeline().runs.load(Ordering::SeqCst), 2);
        assert_eq!(last.unwrap().checked, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let engine = MonitorEngine::new(CountingPipeline::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(engine.run_every(Duration::from_secs(10), &cancel).await.is_none());
        assert_eq!(engine.pipeline().runs.load(Ordering::SeqCst), 0);
    }
}
