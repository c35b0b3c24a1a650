pub mod assembler;
pub mod copiers;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod schema;
pub mod series_cache;

pub use dispatcher::{IncomingSeries, IngestOutcome};
pub use error::IngestError;
pub use retry::RetryPolicy;

use crate::datamodel::{LabelSet, MetricBatch, SeriesId};
use crate::ingest::assembler::BatchAssembler;
use crate::ingest::copiers::CopierPool;
use crate::ingest::schema::MetricRegistry;
use crate::ingest::series_cache::SeriesCache;
use crate::storage::SeriesStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resource knobs of the ingestion pipeline. The HTTP configuration
/// layer derives one of these from the process configuration; tests
/// construct it directly.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Memory budget of the series identity cache, in bytes.
    pub series_cache_memory_bytes: u64,
    /// Maximum rows per sealed batch.
    pub batch_max_rows: usize,
    /// Maximum time rows may buffer before their batch is sealed.
    pub batch_max_delay: Duration,
    /// Total buffered row budget across all metrics; exceeding it
    /// rejects appends with backpressure.
    pub max_buffered_rows: usize,
    /// Number of copier workers, caps backend write concurrency.
    pub copier_count: usize,
    /// Sealed-batch queue capacity per copier worker.
    pub copier_queue_batches: usize,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            series_cache_memory_bytes: 64 * 1024 * 1024,
            batch_max_rows: 8192,
            batch_max_delay: Duration::from_millis(250),
            max_buffered_rows: 1_000_000,
            copier_count: 4,
            copier_queue_batches: 64,
            retry: RetryPolicy::default(),
        }
    }
}

/// Monotonic counters describing what the pipeline has done so far.
#[derive(Debug, Default)]
pub struct PipelineStats {
    rows_written: AtomicU64,
    rows_rejected: AtomicU64,
    rows_abandoned: AtomicU64,
    write_retries: AtomicU64,
    batches_enqueued: AtomicU64,
    batches_written: AtomicU64,
    batches_abandoned: AtomicU64,
}

impl PipelineStats {
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Acquire)
    }
    pub fn rows_rejected(&self) -> u64 {
        self.rows_rejected.load(Ordering::Acquire)
    }
    pub fn rows_abandoned(&self) -> u64 {
        self.rows_abandoned.load(Ordering::Acquire)
    }
    pub fn write_retries(&self) -> u64 {
        self.write_retries.load(Ordering::Acquire)
    }
    pub fn batches_enqueued(&self) -> u64 {
        self.batches_enqueued.load(Ordering::Acquire)
    }
    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Acquire)
    }
    pub fn batches_abandoned(&self) -> u64 {
        self.batches_abandoned.load(Ordering::Acquire)
    }

    pub(crate) fn add_rejected(&self, rows: u64) {
        self.rows_rejected.fetch_add(rows, Ordering::AcqRel);
    }
    pub(crate) fn inc_write_retries(&self) {
        self.write_retries.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn inc_enqueued(&self) {
        self.batches_enqueued.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn record_write(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::AcqRel);
        self.batches_written.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn record_abandoned(&self, rows: u64) {
        self.rows_abandoned.fetch_add(rows, Ordering::AcqRel);
        self.batches_abandoned.fetch_add(1, Ordering::AcqRel);
    }
}

/// The ingestion pipeline service object.
///
/// Constructed once at process start, shared by all request-handling
/// tasks via `Arc`, torn down with [`IngestPipeline::shutdown`]. Owns
/// the identity cache, the schema registry, the batch assembler and the
/// copier pool; the storage backend is the only external collaborator.
pub struct IngestPipeline {
    pub(crate) series: Arc<SeriesCache>,
    pub(crate) registry: Arc<MetricRegistry>,
    pub(crate) assembler: Arc<BatchAssembler>,
    pub(crate) stats: Arc<PipelineStats>,
    flush_notify: Arc<Notify>,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
    copiers: Mutex<Option<CopierPool>>,
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("series", &self.series)
            .field("registry", &self.registry)
            .finish()
    }
}

struct FlusherContext {
    assembler: Arc<BatchAssembler>,
    registry: Arc<MetricRegistry>,
    series: Arc<SeriesCache>,
    stats: Arc<PipelineStats>,
    senders: Vec<mpsc::Sender<MetricBatch>>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    tick: Duration,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn SeriesStore>, config: PipelineConfig) -> Arc<Self> {
        let flush_notify = Arc::new(Notify::new());
        let assembler = Arc::new(BatchAssembler::new(
            config.batch_max_rows,
            config.batch_max_delay,
            config.max_buffered_rows,
            flush_notify.clone(),
        ));
        let series = Arc::new(SeriesCache::with_memory_budget(
            store.clone(),
            config.series_cache_memory_bytes,
        ));
        let registry = Arc::new(MetricRegistry::new(store.clone()));
        let stats = Arc::new(PipelineStats::default());
        let cancel = CancellationToken::new();

        let (pool, senders) = CopierPool::spawn(
            config.copier_count,
            config.copier_queue_batches,
            store,
            config.retry,
            stats.clone(),
            cancel.clone(),
        );

        let context = FlusherContext {
            assembler: assembler.clone(),
            registry: registry.clone(),
            series: series.clone(),
            stats: stats.clone(),
            senders,
            notify: flush_notify.clone(),
            cancel: cancel.clone(),
            tick: (config.batch_max_delay / 2).max(Duration::from_millis(10)),
        };
        let flusher = tokio::spawn(flusher_loop(context));

        Arc::new(Self {
            series,
            registry,
            assembler,
            stats,
            flush_notify,
            cancel,
            flusher: Mutex::new(Some(flusher)),
            copiers: Mutex::new(Some(pool)),
        })
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Cache-only series lookup for the external query layer.
    pub fn lookup_series(&self, labels: &LabelSet) -> Option<SeriesId> {
        self.series.lookup(&labels.fingerprint())
    }

    /// Metric names with ready schemas, for the external query layer.
    pub fn ready_metrics(&self) -> Vec<String> {
        self.registry.ready_metrics()
    }

    /// Blocks until every schema creation currently in flight resolves
    /// to ready or failed.
    pub async fn complete_metric_creation(&self) {
        self.registry.complete_metric_creation().await;
    }

    /// Seal everything and wait until all enqueued batches have been
    /// written or abandoned. Barrier for tests, admin tooling and
    /// shutdown.
    pub async fn flush(&self) {
        self.complete_metric_creation().await;
        loop {
            // Sealing repeatedly also catches rows the flusher promotes
            // out of the pending area while the flush is in progress.
            self.assembler.seal_all();
            self.flush_notify.notify_one();
            let drained = self.assembler.buffered_rows() == 0;
            let settled = self.stats.batches_enqueued()
                == self.stats.batches_written() + self.stats.batches_abandoned();
            if drained && settled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drain buffered rows, then stop the flusher and copier workers.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.cancel.cancel();

        let flusher = self.flusher.lock().expect("flusher lock poisoned").take();
        if let Some(handle) = flusher {
            let _ = handle.await;
        }
        let copiers = self.copiers.lock().expect("copiers lock poisoned").take();
        if let Some(pool) = copiers {
            pool.join().await;
        }

        info!(
            rows_written = self.stats.rows_written(),
            rows_rejected = self.stats.rows_rejected(),
            rows_abandoned = self.stats.rows_abandoned(),
            "ingestion pipeline stopped"
        );
    }
}

async fn flusher_loop(context: FlusherContext) {
    loop {
        tokio::select! {
            _ = context.cancel.cancelled() => break,
            _ = context.notify.notified() => {}
            _ = tokio::time::sleep(context.tick) => {}
        }
        promote_pending(&context).await;
        context.assembler.seal_aged();
        drain_ready(&context).await;
    }

    // Final drain so an orderly shutdown is not data loss.
    promote_pending(&context).await;
    context.assembler.seal_all();
    drain_ready(&context).await;
    // Dropping the senders closes the copier queues.
}

/// Move buffered rows of metrics whose schema resolved out of the
/// pending area: resolve their identities and append them for flushing,
/// or drain and count them rejected when the schema failed. Pending rows
/// keep their budget reservation through promotion; only rows rejected
/// here release it.
async fn promote_pending(context: &FlusherContext) {
    use crate::ingest::schema::SchemaStatus;

    for metric in context.assembler.pending_metrics() {
        let status = match context.registry.status(&metric) {
            // A cancelled creation attempt can orphan pending rows with
            // no caller left to restart it; restart it here.
            SchemaStatus::Unknown => match context.registry.ensure_ready(&metric).await {
                Ok(()) => SchemaStatus::Ready,
                Err(_) => SchemaStatus::Failed,
            },
            status => status,
        };
        match status {
            SchemaStatus::Ready => {
                for series in context.assembler.take_pending(&metric) {
                    let rows = series.samples.len() as u64;
                    match context.series.resolve(&metric, &series.labels).await {
                        Ok(series_id) => {
                            context
                                .assembler
                                .append_reserved(&metric, series_id, &series.samples);
                        }
                        Err(err) => {
                            warn!(metric = %metric, rows, error = %err,
                                "buffered rows dropped, identity resolution failed");
                            context.assembler.release(rows as usize);
                            context.stats.add_rejected(rows);
                        }
                    }
                }
            }
            SchemaStatus::Failed => {
                let drained = context.assembler.take_pending(&metric);
                let rows: u64 = drained
                    .iter()
                    .map(|series| series.samples.len() as u64)
                    .sum();
                if rows > 0 {
                    warn!(metric = %metric, rows, "buffered rows dropped, schema unavailable");
                    context.assembler.release(rows as usize);
                    context.stats.add_rejected(rows);
                }
            }
            SchemaStatus::Creating | SchemaStatus::Unknown => {}
        }
    }
}

async fn drain_ready(context: &FlusherContext) {
    for batch in context.assembler.take_ready() {
        let rows = batch.len();
        if batch.is_empty() {
            continue;
        }
        let worker = copiers::route(&batch.metric, context.senders.len());
        context.stats.inc_enqueued();
        if context.senders[worker].send(batch).await.is_err() {
            // Workers are gone, only possible during teardown.
            context.stats.record_abandoned(rows as u64);
        }
        context.assembler.release(rows);
    }
}
