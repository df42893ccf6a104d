//! Extraction worker orchestration
//!
//! A fixed pool of tasks claims jobs in batches and runs each through the
//! per-job pipeline: load, pre-filter, compilation check, extract,
//! validate, enrich, upsert, duplicate pass, delivery side-effects,
//! terminate. A supervisor task sweeps abandoned jobs back to the queue
//! and the freshness job retiers open assignments on its own period.

pub mod freshness;
pub mod pipeline;
pub mod pool;

use std::sync::Arc;

use tutorflow_config::Config;
use tutorflow_dedup::DuplicateDetector;
use tutorflow_delivery::DeliveryService;
use tutorflow_llm::{CompilationHeuristic, Extractor};
use tutorflow_store::Store;
use tutorflow_utils::MetricsRegistry;

pub use pipeline::process_one;
pub use pool::{WorkerPool, run_job};

/// Everything a worker task needs, wired explicitly at startup. No
/// ambient singletons: the metrics registry and the breaker state inside
/// the extractor are owned here and shared by `Arc`.
pub struct WorkerContext {
    pub store: Arc<dyn Store>,
    pub extractor: Arc<Extractor>,
    pub heuristic: Arc<dyn CompilationHeuristic>,
    pub detector: Arc<DuplicateDetector>,
    pub delivery: Arc<DeliveryService>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: Arc<Config>,
}
