use crate::datamodel::{Fingerprint, LabelSet, Sample};
use crate::ingest::error::IngestError;
use crate::ingest::schema::SchemaStatus;
use crate::ingest::IngestPipeline;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;

/// Key under which rows without a metric name are reported.
const UNNAMED_METRIC: &str = "<missing metric name>";

/// One decoded time series handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct IncomingSeries {
    pub labels: LabelSet,
    pub samples: Vec<Sample>,
}

/// Per-request aggregation of what happened to every row. Failures are
/// batch-granular, so errors are reported per metric, first error wins.
#[derive(Debug, Default, Clone)]
pub struct IngestOutcome {
    pub accepted_rows: u64,
    pub rejected_rows: u64,
    pub metric_errors: HashMap<String, IngestError>,
}

impl IngestOutcome {
    fn reject(&mut self, metric: &str, rows: u64, error: IngestError) {
        self.rejected_rows += rows;
        self.metric_errors
            .entry(metric.to_string())
            .or_insert(error);
    }

    pub fn is_fully_accepted(&self) -> bool {
        self.rejected_rows == 0
    }
}

type SeriesGroups = HashMap<Fingerprint, (LabelSet, Vec<Sample>)>;

impl IngestPipeline {
    /// Ingest one decoded write request.
    ///
    /// Splits the request by metric, resolves identities, ensures
    /// schemas exist and appends rows to the assembler. Partial failures
    /// never fail the call; only input that cannot be split by metric at
    /// all is a hard error.
    pub async fn ingest(
        &self,
        series: Vec<IncomingSeries>,
    ) -> Result<IngestOutcome, IngestError> {
        let mut outcome = IngestOutcome::default();
        let mut by_metric: HashMap<Arc<str>, SeriesGroups> = HashMap::new();
        let mut named_input = false;
        let mut unnamed_rows = 0u64;

        // Group by metric and deduplicate identical label sets within
        // the call. The dedup is an optimization, resolution itself is
        // idempotent.
        for incoming in series {
            if incoming.samples.is_empty() {
                continue;
            }
            let Some(name) = incoming.labels.metric_name() else {
                unnamed_rows += incoming.samples.len() as u64;
                continue;
            };
            named_input = true;
            let metric: Arc<str> = Arc::from(name);
            by_metric
                .entry(metric)
                .or_default()
                .entry(incoming.labels.fingerprint())
                .and_modify(|(_, samples)| samples.extend(incoming.samples.iter().copied()))
                .or_insert((incoming.labels, incoming.samples));
        }

        if !named_input && unnamed_rows > 0 {
            return Err(IngestError::InvalidSeries(
                "no series in the request carries a metric name".to_string(),
            ));
        }
        if unnamed_rows > 0 {
            outcome.reject(
                UNNAMED_METRIC,
                unnamed_rows,
                IngestError::InvalidSeries("missing metric name label".to_string()),
            );
        }

        // Partition metrics by schema state. First-seen metrics kick off
        // creation concurrently with each other; metrics another caller
        // is already creating get their rows buffered without blocking.
        let mut resolvable: Vec<Arc<str>> = Vec::new();
        let mut first_seen: Vec<Arc<str>> = Vec::new();
        let mut in_creation: Vec<Arc<str>> = Vec::new();
        for metric in by_metric.keys() {
            match self.registry.status(metric) {
                SchemaStatus::Ready => resolvable.push(metric.clone()),
                SchemaStatus::Creating => in_creation.push(metric.clone()),
                SchemaStatus::Unknown | SchemaStatus::Failed => first_seen.push(metric.clone()),
            }
        }

        let creation_results = join_all(first_seen.into_iter().map(|metric| async move {
            let result = self.registry.ensure_ready(&metric).await;
            (metric, result)
        }))
        .await;
        for (metric, result) in creation_results {
            match result {
                Ok(()) => resolvable.push(metric),
                Err(err) => {
                    let groups = by_metric.remove(&metric).unwrap_or_default();
                    let rows: u64 = groups
                        .values()
                        .map(|(_, samples)| samples.len() as u64)
                        .sum();
                    outcome.reject(&metric, rows, err);
                }
            }
        }

        for metric in in_creation {
            let groups = by_metric.remove(&metric).unwrap_or_default();
            for (_, (labels, samples)) in groups {
                let rows = samples.len() as u64;
                match self.assembler.append_pending(&metric, labels, samples) {
                    Ok(()) => outcome.accepted_rows += rows,
                    Err(err) => outcome.reject(&metric, rows, err),
                }
            }
        }

        for metric in resolvable {
            let groups = by_metric.remove(&metric).unwrap_or_default();
            for (_, (labels, samples)) in groups {
                let rows = samples.len() as u64;
                match self.series.resolve(&metric, &labels).await {
                    Ok(series_id) => match self.assembler.append(&metric, series_id, &samples) {
                        Ok(()) => outcome.accepted_rows += rows,
                        Err(err) => outcome.reject(&metric, rows, err),
                    },
                    Err(err) => outcome.reject(&metric, rows, err),
                }
            }
        }

        self.stats.add_rejected(outcome.rejected_rows);
        Ok(outcome)
    }
}
