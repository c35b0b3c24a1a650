use crate::datamodel::MetricBatch;
use crate::ingest::error::IngestError;
use crate::ingest::retry::{RetryDecision, RetryPolicy};
use crate::ingest::PipelineStats;
use crate::storage::{ErrorClass, SeriesStore};
use rand::Rng;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A fixed set of workers draining sealed batches and bulk-writing them
/// to the backend.
///
/// Batches are routed to a worker by hashing the metric name, so batches
/// for the same metric are always written by the same worker in the
/// order they were sealed, while different metrics proceed concurrently.
/// Worker count caps backend write concurrency.
#[derive(Debug)]
pub struct CopierPool {
    handles: Vec<JoinHandle<()>>,
}

impl CopierPool {
    pub fn spawn(
        count: usize,
        queue_batches: usize,
        store: Arc<dyn SeriesStore>,
        policy: RetryPolicy,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> (Self, Vec<mpsc::Sender<MetricBatch>>) {
        let count = count.max(1);
        let mut handles = Vec::with_capacity(count);
        let mut senders = Vec::with_capacity(count);

        for worker_id in 0..count {
            let (sender, receiver) = mpsc::channel(queue_batches.max(1));
            senders.push(sender);
            let store = store.clone();
            let policy = policy.clone();
            let stats = stats.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, receiver, store, policy, stats, cancel).await;
            }));
        }

        (Self { handles }, senders)
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Stable routing of a metric name to a worker index.
pub fn route(metric: &str, workers: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    metric.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn worker_loop(
    worker_id: usize,
    mut receiver: mpsc::Receiver<MetricBatch>,
    store: Arc<dyn SeriesStore>,
    policy: RetryPolicy,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "copier worker started");
    // The queue is drained to the end even during shutdown; the sender
    // side closes once the flusher has sealed everything.
    while let Some(batch) = receiver.recv().await {
        write_with_retry(&store, &policy, &stats, &cancel, batch).await;
    }
    debug!(worker_id, "copier worker stopped");
}

async fn write_with_retry(
    store: &Arc<dyn SeriesStore>,
    policy: &RetryPolicy,
    stats: &PipelineStats,
    cancel: &CancellationToken,
    batch: MetricBatch,
) {
    let metric = batch.metric.clone();
    let rows = batch.len() as u64;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let err = match store.copy_rows(&metric, &batch.rows).await {
            Ok(()) => {
                stats.record_write(rows);
                debug!(metric = %metric, rows, attempt, "batch written");
                return;
            }
            Err(err) => err,
        };

        let class = err.class();
        match policy.decide(class, attempt) {
            RetryDecision::Retry(delay) => {
                stats.inc_write_retries();
                let delay = with_jitter(delay);
                warn!(
                    metric = %metric, rows, attempt, delay_ms = delay.as_millis() as u64,
                    error = %err, "transient write failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        stats.record_abandoned(rows);
                        warn!(metric = %metric, rows, "write cancelled during backoff, batch abandoned");
                        return;
                    }
                }
            }
            RetryDecision::GiveUp => {
                stats.record_abandoned(rows);
                let reason = match class {
                    ErrorClass::Transient => IngestError::TransientWriteFailure {
                        attempts: attempt,
                        details: err.to_string(),
                    },
                    ErrorClass::Permanent => IngestError::PermanentWriteFailure(err.to_string()),
                };
                error!(metric = %metric, rows, error = %reason, "batch abandoned");
                return;
            }
        }
    }
}

/// Spread concurrent retries apart; up to half the delay is added.
fn with_jitter(delay: Duration) -> Duration {
    let half = delay.as_millis() as u64 / 2;
    if half == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=half))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_stable_and_in_range() {
        for workers in 1..8 {
            let first = route("cpu_seconds_total", workers);
            assert_eq!(first, route("cpu_seconds_total", workers));
            assert!(first < workers);
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_millis(50));
        }
    }
}
