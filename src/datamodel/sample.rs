/// Backend-assigned permanent identifier for one label set.
pub type SeriesId = i64;

/// One timestamped value as received from the transport layer, before
/// its series has been resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

/// A sample bound to its resolved series, ready for bulk write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Row {
    pub series_id: SeriesId,
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Row {
    pub fn new(series_id: SeriesId, sample: Sample) -> Self {
        Self {
            series_id,
            timestamp_ms: sample.timestamp_ms,
            value: sample.value,
        }
    }
}
