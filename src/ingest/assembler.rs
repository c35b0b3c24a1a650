use crate::datamodel::{LabelSet, MetricBatch, Row, Sample, SeriesId};
use crate::ingest::error::IngestError;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug)]
struct OpenBatch {
    rows: Vec<Row>,
    opened_at: Instant,
}

/// Rows admitted for a metric whose schema is still being created.
/// They stay unresolved until the schema is ready, per the invariant
/// that no series id exists for a metric that is not ready.
#[derive(Debug)]
pub struct PendingSeries {
    pub labels: LabelSet,
    pub samples: Vec<Sample>,
}

/// Groups resolved rows into per-metric batches bounded by row count and
/// buffering delay, decoupling arrival rate from write rate.
///
/// `append` never blocks: when the total buffered row budget is
/// exhausted it rejects, which is the admission-control mechanism
/// against a backend that cannot keep up. Sealed batches queue up in
/// completion order until the flusher hands them to the copier pool.
#[derive(Debug)]
pub struct BatchAssembler {
    max_batch_rows: usize,
    max_batch_delay: Duration,
    max_buffered_rows: usize,
    buffered_rows: AtomicUsize,
    open: Mutex<HashMap<Arc<str>, OpenBatch>>,
    pending: Mutex<HashMap<Arc<str>, Vec<PendingSeries>>>,
    ready: Mutex<VecDeque<MetricBatch>>,
    flush_notify: Arc<Notify>,
}

impl BatchAssembler {
    pub fn new(
        max_batch_rows: usize,
        max_batch_delay: Duration,
        max_buffered_rows: usize,
        flush_notify: Arc<Notify>,
    ) -> Self {
        Self {
            max_batch_rows,
            max_batch_delay,
            max_buffered_rows,
            buffered_rows: AtomicUsize::new(0),
            open: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            flush_notify,
        }
    }

    fn try_reserve(&self, rows: usize) -> Result<(), IngestError> {
        self.buffered_rows
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current + rows > self.max_buffered_rows {
                    None
                } else {
                    Some(current + rows)
                }
            })
            .map(|_| ())
            .map_err(|_| IngestError::BackpressureRejected)
    }

    /// Called once rows leave the assembler for the copier queue, or are
    /// drained after a schema failure.
    pub fn release(&self, rows: usize) {
        self.buffered_rows.fetch_sub(rows, Ordering::AcqRel);
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffered_rows.load(Ordering::Acquire)
    }

    /// Append resolved samples to the metric's accumulating batch,
    /// sealing full batches as a side effect.
    pub fn append(
        &self,
        metric: &Arc<str>,
        series_id: SeriesId,
        samples: &[Sample],
    ) -> Result<(), IngestError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.try_reserve(samples.len())?;
        self.append_reserved(metric, series_id, samples);
        Ok(())
    }

    /// Append samples whose budget reservation is already held, used
    /// when promoting pending rows: their reservation travels with them,
    /// so admitted rows can never lose a backpressure race afterwards.
    pub fn append_reserved(&self, metric: &Arc<str>, series_id: SeriesId, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        let mut sealed = Vec::new();
        {
            let mut open = self.open.lock().expect("open lock poisoned");
            let entry = open.entry(metric.clone()).or_insert_with(|| OpenBatch {
                rows: Vec::new(),
                opened_at: Instant::now(),
            });
            entry
                .rows
                .extend(samples.iter().map(|sample| Row::new(series_id, *sample)));

            while entry.rows.len() >= self.max_batch_rows {
                let rest = entry.rows.split_off(self.max_batch_rows);
                let full = std::mem::replace(&mut entry.rows, rest);
                sealed.push(MetricBatch::new(metric.clone(), full));
            }
            if entry.rows.is_empty() {
                open.remove(metric);
            }
        }

        if !sealed.is_empty() {
            self.enqueue_ready(sealed);
        }
    }

    /// Buffer unresolved rows for a metric whose schema creation is in
    /// flight. Non-blocking, still counts against the buffered budget.
    pub fn append_pending(
        &self,
        metric: &Arc<str>,
        labels: LabelSet,
        samples: Vec<Sample>,
    ) -> Result<(), IngestError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.try_reserve(samples.len())?;
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending
            .entry(metric.clone())
            .or_default()
            .push(PendingSeries { labels, samples });
        Ok(())
    }

    /// Metrics that currently hold pending rows.
    pub fn pending_metrics(&self) -> Vec<Arc<str>> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        pending.keys().cloned().collect()
    }

    /// Remove and return the pending rows of a metric. Their budget
    /// reservation stays held and transfers to the caller, who promotes
    /// them through `append_reserved` or calls `release` for rows it
    /// rejects.
    pub fn take_pending(&self, metric: &str) -> Vec<PendingSeries> {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.remove(metric).unwrap_or_default()
    }

    /// Seal open batches that have buffered longer than the configured
    /// delay.
    pub fn seal_aged(&self) {
        let mut sealed = Vec::new();
        {
            let mut open = self.open.lock().expect("open lock poisoned");
            let aged: Vec<Arc<str>> = open
                .iter()
                .filter(|(_, batch)| batch.opened_at.elapsed() >= self.max_batch_delay)
                .map(|(metric, _)| metric.clone())
                .collect();
            for metric in aged {
                if let Some(batch) = open.remove(&metric) {
                    sealed.push(MetricBatch::new(metric, batch.rows));
                }
            }
        }
        if !sealed.is_empty() {
            self.enqueue_ready(sealed);
        }
    }

    /// Seal everything that is open, used by explicit flushes and
    /// shutdown.
    pub fn seal_all(&self) {
        let mut sealed = Vec::new();
        {
            let mut open = self.open.lock().expect("open lock poisoned");
            for (metric, batch) in open.drain() {
                sealed.push(MetricBatch::new(metric, batch.rows));
            }
        }
        if !sealed.is_empty() {
            self.enqueue_ready(sealed);
        }
    }

    /// Drain sealed batches in completion order.
    pub fn take_ready(&self) -> Vec<MetricBatch> {
        let mut ready = self.ready.lock().expect("ready lock poisoned");
        ready.drain(..).collect()
    }

    fn enqueue_ready(&self, batches: Vec<MetricBatch>) {
        {
            let mut ready = self.ready.lock().expect("ready lock poisoned");
            ready.extend(batches);
        }
        self.flush_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::METRIC_NAME_LABEL;

    fn samples(count: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| Sample {
                timestamp_ms: i as i64 * 1000,
                value: i as f64,
            })
            .collect()
    }

    fn assembler(max_batch_rows: usize, max_buffered_rows: usize) -> BatchAssembler {
        BatchAssembler::new(
            max_batch_rows,
            Duration::from_millis(10),
            max_buffered_rows,
            Arc::new(Notify::new()),
        )
    }

    #[test]
    fn test_seals_full_batches() {
        let assembler = assembler(5, 1000);
        let metric: Arc<str> = Arc::from("cpu");

        assembler.append(&metric, 1, &samples(12)).unwrap();

        let ready = assembler.take_ready();
        assert_eq!(ready.len(), 2);
        assert!(ready.iter().all(|batch| batch.len() == 5));
        // Two rows stay open.
        assert_eq!(assembler.buffered_rows(), 12);
    }

    #[test]
    fn test_backpressure_boundary() {
        let assembler = assembler(1000, 10);
        let metric: Arc<str> = Arc::from("cpu");

        assembler.append(&metric, 1, &samples(10)).unwrap();
        let err = assembler.append(&metric, 1, &samples(1)).unwrap_err();
        assert_eq!(err, IngestError::BackpressureRejected);
    }

    #[test]
    fn test_pending_counts_against_budget() {
        let assembler = assembler(1000, 10);
        let metric: Arc<str> = Arc::from("cpu");
        let labels = LabelSet::from_pairs([(METRIC_NAME_LABEL.to_string(), "cpu".to_string())]);

        assembler
            .append_pending(&metric, labels.clone(), samples(8))
            .unwrap();
        let err = assembler
            .append_pending(&metric, labels, samples(3))
            .unwrap_err();
        assert_eq!(err, IngestError::BackpressureRejected);

        let taken = assembler.take_pending(&metric);
        assert_eq!(taken.len(), 1);
        assembler.release(8);
        assert_eq!(assembler.buffered_rows(), 0);
    }

    #[test]
    fn test_take_pending_keeps_reservation() {
        let assembler = assembler(1000, 10);
        let metric: Arc<str> = Arc::from("cpu");
        let labels = LabelSet::from_pairs([(METRIC_NAME_LABEL.to_string(), "cpu".to_string())]);

        assembler.append_pending(&metric, labels, samples(8)).unwrap();
        let taken = assembler.take_pending(&metric);
        assert_eq!(assembler.buffered_rows(), 8);

        // The budget is still held, a concurrent append cannot steal it.
        let err = assembler.append(&metric, 1, &samples(3)).unwrap_err();
        assert_eq!(err, IngestError::BackpressureRejected);

        // Promotion reuses the held reservation instead of re-reserving.
        assembler.append_reserved(&metric, 1, &taken[0].samples);
        assert_eq!(assembler.buffered_rows(), 8);
        assembler.seal_all();
        let ready = assembler.take_ready();
        assert_eq!(ready.iter().map(MetricBatch::len).sum::<usize>(), 8);
    }

    #[tokio::test]
    async fn test_seal_aged() {
        let assembler = assembler(1000, 1000);
        let metric: Arc<str> = Arc::from("cpu");

        assembler.append(&metric, 1, &samples(3)).unwrap();
        assert!(assembler.take_ready().is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assembler.seal_aged();

        let ready = assembler.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].len(), 3);
    }

    #[test]
    fn test_seal_all() {
        let assembler = assembler(1000, 1000);
        let cpu: Arc<str> = Arc::from("cpu");
        let mem: Arc<str> = Arc::from("mem");

        assembler.append(&cpu, 1, &samples(2)).unwrap();
        assembler.append(&mem, 2, &samples(4)).unwrap();
        assembler.seal_all();

        let ready = assembler.take_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready.iter().map(MetricBatch::len).sum::<usize>(), 6);
    }
}
