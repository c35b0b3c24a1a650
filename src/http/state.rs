use crate::ingest::IngestPipeline;
use crate::storage::SeriesStore;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct HttpServerState {
    pub pipeline: Arc<IngestPipeline>,
    pub storage: Arc<dyn SeriesStore>,
}
