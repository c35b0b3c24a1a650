use super::sample::Row;
use std::sync::Arc;

/// A sealed group of rows for one metric, owned by exactly one copier
/// worker once handed over. Immutable after sealing.
#[derive(Debug)]
pub struct MetricBatch {
    pub metric: Arc<str>,
    pub rows: Vec<Row>,
}

impl MetricBatch {
    pub fn new(metric: Arc<str>, rows: Vec<Row>) -> Self {
        Self { metric, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
