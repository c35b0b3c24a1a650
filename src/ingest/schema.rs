use crate::ingest::error::IngestError;
use crate::storage::SeriesStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info};

type CreationOutcome = Result<(), IngestError>;

/// Observable schema state of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Unknown,
    Creating,
    Ready,
    Failed,
}

enum MetricState {
    Creating(watch::Receiver<Option<CreationOutcome>>),
    Ready,
    Failed(IngestError),
}

enum Role {
    Done(CreationOutcome),
    Waiter(watch::Receiver<Option<CreationOutcome>>),
    Leader(watch::Sender<Option<CreationOutcome>>),
}

/// Reverts a metric stuck in `creating` when its leader future is
/// dropped before publishing an outcome. The metric goes back to
/// `unknown` so the next caller retries the creation instead of
/// observing a wedged state forever. A published `ready`/`failed` entry
/// is never touched.
struct CreationGuard<'a> {
    registry: &'a MetricRegistry,
    metric: &'a str,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        let mut metrics = self
            .registry
            .metrics
            .lock()
            .expect("metrics lock poisoned");
        if matches!(metrics.get(self.metric), Some(MetricState::Creating(_))) {
            metrics.remove(self.metric);
        }
    }
}

/// Tracks, per metric name, whether its backing table exists, and
/// serializes concurrent creation attempts for the same metric.
///
/// State machine per metric: unknown → creating → ready, or
/// creating → failed. `failed` is sticky until process restart.
pub struct MetricRegistry {
    store: Arc<dyn SeriesStore>,
    metrics: Mutex<HashMap<String, MetricState>>,
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        f.debug_struct("MetricRegistry")
            .field("metrics", &metrics.len())
            .finish()
    }
}

impl MetricRegistry {
    pub fn new(store: Arc<dyn SeriesStore>) -> Self {
        Self {
            store,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self, metric: &str) -> SchemaStatus {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        match metrics.get(metric) {
            None => SchemaStatus::Unknown,
            Some(MetricState::Creating(_)) => SchemaStatus::Creating,
            Some(MetricState::Ready) => SchemaStatus::Ready,
            Some(MetricState::Failed(_)) => SchemaStatus::Failed,
        }
    }

    pub fn is_ready(&self, metric: &str) -> bool {
        self.status(metric) == SchemaStatus::Ready
    }

    /// Metric names whose schema is ready, consumable by the external
    /// query layer.
    pub fn ready_metrics(&self) -> Vec<String> {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        metrics
            .iter()
            .filter(|(_, state)| matches!(state, MetricState::Ready))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Idempotent, safe under concurrent calls for the same metric: the
    /// first caller creates the table, concurrent callers block until
    /// that attempt resolves and share its outcome.
    pub async fn ensure_ready(&self, metric: &str) -> CreationOutcome {
        loop {
            let role = {
                let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
                match metrics.get(metric) {
                    Some(MetricState::Ready) => Role::Done(Ok(())),
                    Some(MetricState::Failed(err)) => Role::Done(Err(err.clone())),
                    Some(MetricState::Creating(receiver)) => Role::Waiter(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        metrics.insert(metric.to_string(), MetricState::Creating(receiver));
                        Role::Leader(sender)
                    }
                }
            };

            match role {
                Role::Done(outcome) => return outcome,
                Role::Waiter(mut receiver) => {
                    match receiver.wait_for(|value| value.is_some()).await {
                        Ok(value) => return value.clone().expect("waited for a published outcome"),
                        // The creating leader was dropped before
                        // publishing; take over with a fresh attempt.
                        Err(_) => continue,
                    }
                }
                Role::Leader(sender) => {
                    // The guard reverts `creating` to absent if this
                    // future is dropped mid-creation.
                    let guard = CreationGuard {
                        registry: self,
                        metric,
                    };
                    // The store treats a table created concurrently by
                    // another process as success, so a conflict never
                    // surfaces here.
                    let outcome = match self.store.create_metric_table(metric).await {
                        Ok(()) => {
                            info!(metric, "metric schema ready");
                            Ok(())
                        }
                        Err(err) => {
                            error!(metric, error = %err, "metric schema creation failed");
                            Err(IngestError::SchemaCreationFailed {
                                metric: metric.to_string(),
                                details: err.to_string(),
                            })
                        }
                    };

                    {
                        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
                        let state = match &outcome {
                            Ok(()) => MetricState::Ready,
                            Err(err) => MetricState::Failed(err.clone()),
                        };
                        metrics.insert(metric.to_string(), state);
                    }
                    // The terminal state is published; the guard's
                    // `creating` check makes its drop a no-op now.
                    drop(guard);
                    let _ = sender.send(Some(outcome.clone()));
                    return outcome;
                }
            }
        }
    }

    /// Synchronous barrier: blocks until every metric currently in the
    /// creating state resolves to ready or failed.
    pub async fn complete_metric_creation(&self) {
        let pending: Vec<watch::Receiver<Option<CreationOutcome>>> = {
            let metrics = self.metrics.lock().expect("metrics lock poisoned");
            metrics
                .values()
                .filter_map(|state| match state {
                    MetricState::Creating(receiver) => Some(receiver.clone()),
                    _ => None,
                })
                .collect()
        };

        for mut receiver in pending {
            // A closed channel means the attempt was dropped, which is
            // also a resolution for barrier purposes.
            let _ = receiver.wait_for(|value| value.is_some()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ensure_ready_is_idempotent() {
        let store = Arc::new(MockStore::new());
        let registry = MetricRegistry::new(store.clone());

        registry.ensure_ready("cpu").await.unwrap();
        registry.ensure_ready("cpu").await.unwrap();

        assert_eq!(store.table_create_calls(), 1);
        assert_eq!(registry.status("cpu"), SchemaStatus::Ready);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_attempt() {
        let store = Arc::new(MockStore::new());
        store.set_creation_delay(Duration::from_millis(50));
        let registry = Arc::new(MetricRegistry::new(store.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.ensure_ready("cpu").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.table_create_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_is_sticky() {
        let store = Arc::new(MockStore::new());
        store.fail_table_creation("broken");
        let registry = MetricRegistry::new(store.clone());

        let first = registry.ensure_ready("broken").await.unwrap_err();
        assert!(matches!(first, IngestError::SchemaCreationFailed { .. }));

        // Even after the injected fault is lifted, the state stays failed.
        store.clear_table_failures();
        let second = registry.ensure_ready("broken").await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(store.table_create_calls(), 1);
    }

    #[tokio::test]
    async fn test_completion_barrier_waits_for_creating() {
        let store = Arc::new(MockStore::new());
        store.set_creation_delay(Duration::from_millis(50));
        let registry = Arc::new(MetricRegistry::new(store.clone()));

        let creator = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.ensure_ready("cpu").await })
        };
        // Let the creation attempt register itself.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.status("cpu"), SchemaStatus::Creating);

        registry.complete_metric_creation().await;
        assert_eq!(registry.status("cpu"), SchemaStatus::Ready);
        creator.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_creation_can_be_retried() {
        let store = Arc::new(MockStore::new());
        store.set_creation_delay(Duration::from_millis(100));
        let registry = Arc::new(MetricRegistry::new(store.clone()));

        let leader = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.ensure_ready("cpu").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.status("cpu"), SchemaStatus::Creating);
        leader.abort();
        let _ = leader.await;

        // The dropped attempt reverted, it did not wedge the metric.
        assert_eq!(registry.status("cpu"), SchemaStatus::Unknown);

        store.set_creation_delay(Duration::ZERO);
        registry.ensure_ready("cpu").await.unwrap();
        assert_eq!(registry.status("cpu"), SchemaStatus::Ready);
        assert_eq!(store.table_create_calls(), 2);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_after_cancelled_leader() {
        let store = Arc::new(MockStore::new());
        store.set_creation_delay(Duration::from_millis(100));
        let registry = Arc::new(MetricRegistry::new(store.clone()));

        let leader = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.ensure_ready("cpu").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.ensure_ready("cpu").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let _ = leader.await;

        waiter.await.unwrap().unwrap();
        assert_eq!(registry.status("cpu"), SchemaStatus::Ready);
        assert_eq!(store.table_create_calls(), 2);
    }

    #[tokio::test]
    async fn test_ready_metrics_listing() {
        let store = Arc::new(MockStore::new());
        store.fail_table_creation("broken");
        let registry = MetricRegistry::new(store);

        registry.ensure_ready("cpu").await.unwrap();
        registry.ensure_ready("broken").await.unwrap_err();

        assert_eq!(registry.ready_metrics(), vec!["cpu".to_string()]);
    }
}
