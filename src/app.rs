use std::sync::Arc;

use crate::aggregate::Aggregator;
use crate::batch::LogBatchCollector;
use crate::batch::source::LogSource;
use crate::config::AppConfig;
use crate::db::TargetDatabase;
use crate::explain::{ExplainCollector, ExplainWorker};
use crate::jobs::JobTracker;
use crate::metrics::AppMetrics;
use crate::registry::InstanceRegistry;
use crate::state::SharedState;
use crate::store::SlowQueryStore;

/// Shared application context passed to HTTP handlers and pollers.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn SlowQueryStore>,
    pub target: Arc<dyn TargetDatabase>,
    pub metrics: AppMetrics,
    pub state: SharedState,
    pub registry: InstanceRegistry,
    pub jobs: JobTracker,
    pub explain: ExplainCollector,
    pub batch: LogBatchCollector,
    pub aggregator: Aggregator,
}

impl AppContext {
    /// Wire every component from its collaborators. The returned worker must be spawned
    /// for queued explain requests to be served.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn SlowQueryStore>,
        target: Arc<dyn TargetDatabase>,
        log_source: Arc<dyn LogSource>,
        metrics: AppMetrics,
    ) -> (Self, ExplainWorker) {
        let config = Arc::new(config);
        let registry = InstanceRegistry::new(config.registry.environment.clone(), store.clone());
        let jobs = JobTracker::new();
        let (explain, worker) = ExplainCollector::new(
            target.clone(),
            store.clone(),
            registry.clone(),
            metrics.clone(),
            &config.explain,
        );
        let batch = LogBatchCollector::new(
            registry.clone(),
            log_source,
            store.clone(),
            jobs.clone(),
            metrics.clone(),
            config.batch.clone(),
        );
        let aggregator = Aggregator::new(store.clone());

        let ctx = Self {
            config,
            store,
            target,
            metrics,
            state: SharedState::new(),
            registry,
            jobs,
            explain,
            batch,
            aggregator,
        };
        (ctx, worker)
    }
}
