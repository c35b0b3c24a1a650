use crate::datamodel::{Fingerprint, LabelSet, SeriesId};
use crate::ingest::error::IngestError;
use crate::storage::SeriesStore;
use clru::CLruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Rough in-memory cost of one cache entry, key plus value plus map
/// overhead. Used to turn the memory budget into an entry capacity.
const APPROX_ENTRY_BYTES: u64 = 128;

/// Smallest capacity the cache ever gets, whatever the budget says.
const MIN_CAPACITY: usize = 16;

type ResolveOutcome = Result<SeriesId, IngestError>;

enum Role {
    Leader(watch::Sender<Option<ResolveOutcome>>),
    Follower(watch::Receiver<Option<ResolveOutcome>>),
}

/// Clears the in-flight marker of a resolution leader. Dropping the
/// leader future before it publishes closes the watch channel, and the
/// guard's removal lets followers re-elect instead of waiting on a dead
/// channel.
struct InFlightGuard<'a> {
    cache: &'a SeriesCache,
    fingerprint: Fingerprint,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&self.fingerprint);
    }
}

/// Process-wide cache mapping label-set fingerprints to backend-assigned
/// series ids.
///
/// Misses perform a single idempotent get-or-create round trip against
/// the backend. Concurrent misses for the same fingerprint coalesce onto
/// one in-flight request; every caller receives its outcome. Bounded LRU
/// eviction is safe because the backend stays authoritative, an evicted
/// entry simply re-resolves on the next miss.
pub struct SeriesCache {
    store: Arc<dyn SeriesStore>,
    cache: Mutex<CLruCache<Fingerprint, SeriesId>>,
    in_flight: Mutex<HashMap<Fingerprint, watch::Receiver<Option<ResolveOutcome>>>>,
}

impl std::fmt::Debug for SeriesCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl SeriesCache {
    pub fn new(store: Arc<dyn SeriesStore>, capacity: usize) -> Self {
        let capacity =
            NonZeroUsize::new(capacity.max(MIN_CAPACITY)).expect("capacity has a non-zero floor");
        Self {
            store,
            cache: Mutex::new(CLruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_memory_budget(store: Arc<dyn SeriesStore>, budget_bytes: u64) -> Self {
        let capacity = (budget_bytes / APPROX_ENTRY_BYTES) as usize;
        Self::new(store, capacity)
    }

    /// Resolve a label set to its series id, hitting the backend only on
    /// a miss.
    pub async fn resolve(&self, metric: &str, labels: &LabelSet) -> ResolveOutcome {
        let fingerprint = labels.fingerprint();

        loop {
            if let Some(series_id) = self.lookup(&fingerprint) {
                return Ok(series_id);
            }

            let role = {
                let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
                match in_flight.get(&fingerprint) {
                    Some(receiver) => Role::Follower(receiver.clone()),
                    None => {
                        let (sender, receiver) = watch::channel(None);
                        in_flight.insert(fingerprint, receiver);
                        Role::Leader(sender)
                    }
                }
            };

            match role {
                Role::Follower(mut receiver) => {
                    match receiver.wait_for(|value| value.is_some()).await {
                        Ok(value) => return value.clone().expect("waited for a published outcome"),
                        // The leader was dropped before publishing its
                        // outcome; elect a new one.
                        Err(_) => continue,
                    }
                }
                Role::Leader(sender) => {
                    // The guard removes the in-flight marker even when
                    // this future is dropped mid round trip, so a
                    // cancelled resolution never strands later callers.
                    let guard = InFlightGuard {
                        cache: self,
                        fingerprint,
                    };
                    debug!(metric, ?fingerprint, "resolving series against backend");
                    let outcome = self
                        .store
                        .series_id_or_create(metric, labels)
                        .await
                        .map_err(|err| IngestError::IdentityResolutionFailed(err.to_string()));

                    if let Ok(series_id) = &outcome {
                        self.cache
                            .lock()
                            .expect("cache lock poisoned")
                            .put(fingerprint, *series_id);
                    }
                    // Remove before publishing: late arrivals either hit
                    // the cache or start a fresh round trip, never wait
                    // forever.
                    drop(guard);
                    let _ = sender.send(Some(outcome.clone()));
                    return outcome;
                }
            }
        }
    }

    /// Cache-only lookup for the read path, no backend round trip.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<SeriesId> {
        self.cache
            .lock()
            .expect("cache lock poisoned")
            .get(fingerprint)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::METRIC_NAME_LABEL;
    use crate::test_utils::MockStore;

    fn labels(metric: &str, instance: &str) -> LabelSet {
        LabelSet::from_pairs([
            (METRIC_NAME_LABEL.to_string(), metric.to_string()),
            ("instance".to_string(), instance.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_hit_skips_backend() {
        let store = Arc::new(MockStore::new());
        let cache = SeriesCache::new(store.clone(), 64);
        let labels = labels("cpu", "a");

        let first = cache.resolve("cpu", &labels).await.unwrap();
        let second = cache.resolve("cpu", &labels).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.series_create_calls(), 1);
    }

    #[tokio::test]
    async fn test_eviction_re_resolves_to_same_id() {
        let store = Arc::new(MockStore::new());
        let cache = SeriesCache::new(store.clone(), 16);
        let first = cache.resolve("cpu", &labels("cpu", "a")).await.unwrap();

        // Push the first entry out of the LRU.
        for i in 0..32 {
            let l = labels("cpu", &format!("other-{i}"));
            cache.resolve("cpu", &l).await.unwrap();
        }

        let again = cache.resolve("cpu", &labels("cpu", "a")).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_cancelled_resolution_allows_retry() {
        let store = Arc::new(MockStore::new());
        store.set_resolution_delay(std::time::Duration::from_millis(100));
        let cache = Arc::new(SeriesCache::new(store.clone(), 64));
        let labels = labels("cpu", "a");

        let leader = {
            let cache = cache.clone();
            let labels = labels.clone();
            tokio::spawn(async move { cache.resolve("cpu", &labels).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        leader.abort();
        let _ = leader.await;

        // The dropped round trip left no stale in-flight marker behind.
        store.set_resolution_delay(std::time::Duration::ZERO);
        let resolved = cache.resolve("cpu", &labels).await.unwrap();
        let again = cache.resolve("cpu", &labels).await.unwrap();
        assert_eq!(resolved, again);
        assert_eq!(store.series_create_calls(), 2);
    }

    #[tokio::test]
    async fn test_follower_takes_over_after_cancelled_leader() {
        let store = Arc::new(MockStore::new());
        store.set_resolution_delay(std::time::Duration::from_millis(100));
        let cache = Arc::new(SeriesCache::new(store.clone(), 64));
        let labels = labels("cpu", "a");

        let leader = {
            let cache = cache.clone();
            let labels = labels.clone();
            tokio::spawn(async move { cache.resolve("cpu", &labels).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let follower = {
            let cache = cache.clone();
            let labels = labels.clone();
            tokio::spawn(async move { cache.resolve("cpu", &labels).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        leader.abort();
        let _ = leader.await;

        follower.await.unwrap().unwrap();
        assert_eq!(store.series_create_calls(), 2);
    }

    #[tokio::test]
    async fn test_resolution_failure_is_reported_not_cached() {
        let store = Arc::new(MockStore::new());
        store.set_fail_resolution(true);
        let cache = SeriesCache::new(store.clone(), 64);
        let labels = labels("cpu", "a");

        let err = cache.resolve("cpu", &labels).await.unwrap_err();
        assert!(matches!(err, IngestError::IdentityResolutionFailed(_)));

        store.set_fail_resolution(false);
        assert!(cache.resolve("cpu", &labels).await.is_ok());
    }
}
