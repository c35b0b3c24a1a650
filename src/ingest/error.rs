use thiserror::Error;

/// Failures the ingestion pipeline reports back to callers.
///
/// Cloneable because a single resolution or schema-creation outcome is
/// shared with every caller that coalesced onto the same in-flight
/// operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    /// Backend round trip to resolve or create a series id failed for a
    /// reason other than a benign conflict. The affected rows are
    /// rejected, not retried here.
    #[error("series identity resolution failed: {0}")]
    IdentityResolutionFailed(String),

    /// Metric schema creation failed; the metric stays failed until
    /// process restart or operator intervention.
    #[error("schema creation failed for metric '{metric}': {details}")]
    SchemaCreationFailed { metric: String, details: String },

    /// Buffered-row limit reached, the caller must slow down.
    #[error("buffered row limit exceeded")]
    BackpressureRejected,

    /// Bulk write kept failing transiently until the attempt budget ran
    /// out.
    #[error("write failed after {attempts} attempts: {details}")]
    TransientWriteFailure { attempts: u32, details: String },

    /// Malformed rows or a constraint violation, the batch is abandoned
    /// without retry.
    #[error("permanent write failure: {0}")]
    PermanentWriteFailure(String),

    /// The series cannot be placed in the pipeline at all, e.g. it
    /// carries no metric name.
    #[error("invalid series: {0}")]
    InvalidSeries(String),
}
