//! In-memory storage backend used by unit and integration tests.

use crate::datamodel::{LabelSet, Row, SeriesId};
use crate::storage::{SeriesStore, StorageError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct MockStoreState {
    next_series_id: i64,
    series: HashMap<String, SeriesId>,
    tables: HashSet<String>,
    rows: HashMap<String, Vec<Row>>,
    fail_tables: HashSet<String>,
    creation_delay: Duration,
    resolution_delay: Duration,
    transient_write_failures: u64,
}

/// A [`SeriesStore`] that records every backend round trip and supports
/// fault injection, so tests can assert exactly how often and in what
/// state the pipeline talks to its backend.
#[derive(Debug, Default)]
pub struct MockStore {
    state: Mutex<MockStoreState>,
    series_create_calls: AtomicU64,
    table_create_calls: AtomicU64,
    write_calls: AtomicU64,
    fail_resolution: AtomicBool,
    fail_health: AtomicBool,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of get-or-create round trips for series identities.
    pub fn series_create_calls(&self) -> u64 {
        self.series_create_calls.load(Ordering::Acquire)
    }

    pub fn table_create_calls(&self) -> u64 {
        self.table_create_calls.load(Ordering::Acquire)
    }

    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Acquire)
    }

    pub fn set_creation_delay(&self, delay: Duration) {
        self.state.lock().unwrap().creation_delay = delay;
    }

    pub fn set_resolution_delay(&self, delay: Duration) {
        self.state.lock().unwrap().resolution_delay = delay;
    }

    /// Make schema creation for a metric fail with a permanent error.
    pub fn fail_table_creation(&self, metric: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_tables
            .insert(metric.to_string());
    }

    pub fn clear_table_failures(&self) {
        self.state.lock().unwrap().fail_tables.clear();
    }

    /// Make the next `count` bulk writes fail with a transient error.
    pub fn inject_transient_write_failures(&self, count: u64) {
        self.state.lock().unwrap().transient_write_failures = count;
    }

    pub fn set_fail_resolution(&self, fail: bool) {
        self.fail_resolution.store(fail, Ordering::Release);
    }

    pub fn set_fail_health(&self, fail: bool) {
        self.fail_health.store(fail, Ordering::Release);
    }

    pub fn table_exists(&self, metric: &str) -> bool {
        self.state.lock().unwrap().tables.contains(metric)
    }

    pub fn rows_for(&self, metric: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .rows
            .get(metric)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .rows
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl SeriesStore for MockStore {
    async fn create_or_migrate(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn series_id_or_create(
        &self,
        _metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StorageError> {
        self.series_create_calls.fetch_add(1, Ordering::AcqRel);
        if self.fail_resolution.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable(
                "injected resolution failure".to_string(),
            ));
        }
        let delay = self.state.lock().unwrap().resolution_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let key = labels.to_canonical_json().to_string();
        let mut state = self.state.lock().unwrap();
        if let Some(series_id) = state.series.get(&key) {
            return Ok(*series_id);
        }
        state.next_series_id += 1;
        let series_id = state.next_series_id;
        state.series.insert(key, series_id);
        Ok(series_id)
    }

    async fn create_metric_table(&self, metric: &str) -> Result<(), StorageError> {
        self.table_create_calls.fetch_add(1, Ordering::AcqRel);
        let delay = self.state.lock().unwrap().creation_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_tables.contains(metric) {
            return Err(StorageError::Malformed(
                "injected schema creation failure".to_string(),
            ));
        }
        state.tables.insert(metric.to_string());
        Ok(())
    }

    async fn copy_rows(&self, metric: &str, rows: &[Row]) -> Result<(), StorageError> {
        self.write_calls.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.lock().unwrap();
        if state.transient_write_failures > 0 {
            state.transient_write_failures -= 1;
            return Err(StorageError::Unavailable(
                "injected transient write failure".to_string(),
            ));
        }
        state
            .rows
            .entry(metric.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        if self.fail_health.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable(
                "injected health failure".to_string(),
            ));
        }
        Ok(())
    }
}
