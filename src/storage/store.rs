use super::error::StorageError;
use crate::datamodel::{LabelSet, Row, SeriesId};
use async_trait::async_trait;
use std::fmt::Debug;

/// Backend boundary of the ingestion pipeline.
///
/// The backend is authoritative for series identity: `series_id_or_create`
/// must be a single idempotent get-or-create round trip, and the same
/// label set must map to the same id for the lifetime of the backend.
#[async_trait]
pub trait SeriesStore: Send + Sync + Debug {
    /// Create the base schema. Idempotent.
    async fn create_or_migrate(&self) -> Result<(), StorageError>;

    /// Resolve a label set to its permanent series id, creating it when
    /// unseen. A concurrent insert by another process must yield the
    /// existing id, never an error.
    async fn series_id_or_create(
        &self,
        metric: &str,
        labels: &LabelSet,
    ) -> Result<SeriesId, StorageError>;

    /// Create the per-metric data table. A table created concurrently by
    /// another process counts as success.
    async fn create_metric_table(&self, metric: &str) -> Result<(), StorageError>;

    /// Bulk-insert all rows of one batch. All-or-nothing at the call level.
    async fn copy_rows(&self, metric: &str, rows: &[Row]) -> Result<(), StorageError>;

    /// Verify backend connectivity without ingesting anything.
    async fn health_check(&self) -> Result<(), StorageError>;
}
