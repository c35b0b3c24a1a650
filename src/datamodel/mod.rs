pub mod batch;
pub mod labels;
pub mod sample;

pub use batch::MetricBatch;
pub use labels::{Fingerprint, LabelSet, METRIC_NAME_LABEL};
pub use sample::{Row, Sample, SeriesId};
