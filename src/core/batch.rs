//! Fixed-size batches with bounded concurrency and per-item failure isolation.

use crate::utils::error::{MonitorError, Result};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Pause between consecutive batches, not applied after the last one.
    pub inter_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            concurrency: 3,
            inter_batch_delay: Duration::from_secs(2),
        }
    }
}

pub struct BatchScheduler {
    config: BatchConfig,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            ..config
        };
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Index ranges of the consecutive batches for `len` items.
    pub fn plan(&self, len: usize) -> Vec<Range<usize>> {
        (0..len)
            .step_by(self.config.batch_size)
            .map(|start| start..(start + self.config.batch_size).min(len))
            .collect()
    }

    /// Runs `worker` over every item and returns one outcome per item, in
    /// input order. An error or panic in one worker only affects its own
    /// slot.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, worker: F) -> Vec<Result<R>>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let plan = self.plan(items.len());
        let batch_count = plan.len();
        let mut results = Vec::with_capacity(items.len());
        let mut items = items.into_iter().enumerate();
        let worker = &worker;

        for (batch_index, range) in plan.into_iter().enumerate() {
            let chunk: Vec<(usize, T)> = items.by_ref().take(range.len()).collect();
            tracing::debug!(
                "Batch {}/{}: {} items, concurrency {}",
                batch_index + 1,
                batch_count,
                chunk.len(),
                self.config.concurrency
            );

            let mut settled: Vec<(usize, Result<R>)> = stream::iter(chunk)
                .map(|(index, item)| {
                    let guarded = AssertUnwindSafe(async move { worker(item).await }).catch_unwind();
                    async move {
                        let outcome = match guarded.await {
                            Ok(outcome) => outcome,
                            Err(panic) => Err(MonitorError::WorkerPanicked {
                                message: panic_message(&*panic),
                            }),
                        };
                        (index, outcome)
                    }
                })
                .buffer_unordered(self.config.concurrency)
                .collect()
                .await;

            settled.sort_by_key(|(index, _)| *index);
            let failed = settled.iter().filter(|(_, r)| r.is_err()).count();
            if failed > 0 {
                tracing::debug!("Batch {}: {} of {} items failed", batch_index + 1, failed, settled.len());
            }
            results.extend(settled.into_iter().map(|(_, outcome)| outcome));

            let is_last = batch_index + 1 == batch_count;
            if !is_last && !self.config.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.config.inter_batch_delay).await;
            }
        }

        results
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn scheduler(batch_size: usize, concurrency: usize, delay_ms: u64) -> BatchScheduler {
        BatchScheduler::new(BatchConfig {
            batch_size,
            concurrency,
            inter_batch_delay: Duration::from_millis(delay_ms),
        })
    }

    #[test]
    fn test_plan_splits_seven_items_into_three_batches() {
        let plan = scheduler(3, 2, 0).plan(7);
        assert_eq!(plan, vec![0..3, 3..6, 6..7]);
    }

    #[test]
    fn test_plan_for_empty_input() {
        assert!(scheduler(3, 2, 0).plan(0).is_empty());
    }

    #[test]
    fn test_zero_sizes_are_clamped() {
        let scheduler = scheduler(0, 0, 0);
        assert_eq!(scheduler.config().batch_size, 1);
        assert_eq!(scheduler.config().concurrency, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_keep_input_order_and_isolate_failure() {
        let scheduler = scheduler(3, 2, 0);
        let items: Vec<u64> = (0..7).collect();

        let results = scheduler
            .run(items, |n| async move {
                // later items finish first inside each batch
                tokio::time::sleep(Duration::from_millis(100 - n * 10)).await;
                if n == 4 {
                    Err(MonitorError::HttpStatus {
                        status: 500,
                        url: format!("item-{}", n),
                    })
                } else {
                    Ok(n * 2)
                }
            })
            .await;

        assert_eq!(results.len(), 7);
        for (n, result) in results.iter().enumerate() {
            if n == 4 {
                assert!(result.is_err());
            } else {
                assert_eq!(*result.as_ref().unwrap(), n as u64 * 2);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded_and_batches_are_sequential() {
        let scheduler = scheduler(3, 2, 0);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        let results = scheduler
            .run((0..7).collect::<Vec<usize>>(), |n| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let started = started.clone();
                async move {
                    started.lock().unwrap().push(n);
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
            .await;

        assert_eq!(results.len(), 7);
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        // no item of a later batch starts before the earlier batch is done
        let started = started.lock().unwrap();
        let batch_of = |n: usize| n / 3;
        for pair in started.windows(2) {
            assert!(batch_of(pair[0]) <= batch_of(pair[1]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_worker_only_fails_its_item() {
        let scheduler = scheduler(3, 3, 0);

        let results = scheduler
            .run(vec![1, 2, 3], |n| async move {
                if n == 2 {
                    panic!("boom on {}", n);
                }
                Ok(n)
            })
            .await;

        assert_eq!(*results[0].as_ref().unwrap(), 1);
        match &results[1] {
            Err(MonitorError::WorkerPanicked { message }) => assert_eq!(message, "boom on 2"),
            other => panic!("unexpected outcome: {:?}", other.is_ok()),
        }
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_batches_but_not_after_last() {
        let scheduler = scheduler(3, 2, 1_000);
        let start = Instant::now();

        let results = scheduler
            .run((0..7).collect::<Vec<u32>>(), |n| async move { Ok(n) })
            .await;

        assert_eq!(results.len(), 7);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2_000));
        assert!(elapsed < Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn test_empty_input_returns_empty_results() {
        let results = scheduler(3, 2, 1_000)
            .run(Vec::<u32>::new(), |n| async move { Ok(n) })
            .await;
        assert!(results.is_empty());
    }
}
