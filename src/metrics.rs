use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Metrics registry for the agent scraped by Prometheus.
#[derive(Clone)]
pub struct AppMetrics {
    registry: Arc<Registry>,
    loops: LoopMetrics,
    live: LiveMetrics,
    explain: ExplainMetrics,
    batch: BatchMetrics,
    jobs: JobMetrics,
}

impl AppMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new_custom(Some("slowmon".into()), None)?);

        let loops = LoopMetrics::register(&registry)?;
        let live = LiveMetrics::register(&registry)?;
        let explain = ExplainMetrics::register(&registry)?;
        let batch = BatchMetrics::register(&registry)?;
        let jobs = JobMetrics::register(&registry)?;

        Ok(Self {
            registry,
            loops,
            live,
            explain,
            batch,
            jobs,
        })
    }

    /// Observe the execution duration for a loop.
    pub fn observe_duration(&self, loop_name: &str, duration: Duration) {
        self.loops
            .duration
            .with_label_values(&[loop_name])
            .observe(duration.as_secs_f64());
    }

    /// Record a success flag for a loop iteration (1=success, 0=failed).
    pub fn record_success(&self, loop_name: &str, success: bool) {
        self.loops
            .last_success
            .with_label_values(&[loop_name])
            .set(if success { 1 } else { 0 });
    }

    /// Increment the error counter for a loop.
    pub fn inc_error(&self, loop_name: &str) {
        self.loops
            .errors_total
            .with_label_values(&[loop_name])
            .inc();
    }

    pub fn inc_slow_queries(&self, instance: &str, count: u64) {
        self.live
            .detected_total
            .with_label_values(&[instance])
            .inc_by(count);
    }

    pub fn set_live_queries(&self, instance: &str, count: usize) {
        self.live
            .live_queries
            .with_label_values(&[instance])
            .set(count as i64);
    }

    pub fn inc_explain_result(&self, status: &str) {
        self.explain
            .results_total
            .with_label_values(&[status])
            .inc();
    }

    pub fn explain_in_flight(&self, delta: i64) {
        self.explain.in_flight.add(delta);
    }

    pub fn explain_in_flight_now(&self) -> i64 {
        self.explain.in_flight.get()
    }

    pub fn inc_explain_dropped(&self) {
        self.explain.dropped_total.inc();
    }

    pub fn inc_log_events(&self, instance: &str, count: u64) {
        self.batch
            .events_total
            .with_label_values(&[instance])
            .inc_by(count);
    }

    pub fn inc_parse_errors(&self, instance: &str, count: u64) {
        if count > 0 {
            self.batch
                .parse_errors_total
                .with_label_values(&[instance])
                .inc_by(count);
        }
    }

    pub fn inc_fetch_retry(&self, instance: &str) {
        self.batch
            .retries_total
            .with_label_values(&[instance])
            .inc();
    }

    pub fn inc_job_finished(&self, kind: &str, status: &str) {
        self.jobs
            .finished_total
            .with_label_values(&[kind, status])
            .inc();
    }

    pub fn set_digest_stats(&self, period: &str, count: usize) {
        self.jobs
            .digest_stats
            .with_label_values(&[period])
            .set(count as i64);
    }

    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[derive(Clone)]
struct LoopMetrics {
    duration: HistogramVec,
    last_success: IntGaugeVec,
    errors_total: IntCounterVec,
}

impl LoopMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let duration = HistogramVec::new(
            HistogramOpts::new("loop_duration_seconds", "Poll loop execution duration"),
            &["loop"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        let last_success = IntGaugeVec::new(
            Opts::new(
                "loop_last_success",
                "Loop success flag (1=success, 0=failure)",
            ),
            &["loop"],
        )?;
        registry.register(Box::new(last_success.clone()))?;

        let errors_total =
            IntCounterVec::new(Opts::new("loop_errors_total", "Total loop errors"), &["loop"])?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            duration,
            last_success,
            errors_total,
        })
    }
}

#[derive(Clone)]
struct LiveMetrics {
    detected_total: IntCounterVec,
    live_queries: IntGaugeVec,
}

impl LiveMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let detected_total = IntCounterVec::new(
            Opts::new(
                "slow_queries_detected_total",
                "Slow queries first observed by the live poller",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(detected_total.clone()))?;

        let live_queries = IntGaugeVec::new(
            Opts::new("live_slow_queries", "Slow queries currently running"),
            &["instance"],
        )?;
        registry.register(Box::new(live_queries.clone()))?;

        Ok(Self {
            detected_total,
            live_queries,
        })
    }
}

#[derive(Clone)]
struct ExplainMetrics {
    results_total: IntCounterVec,
    in_flight: IntGauge,
    dropped_total: IntCounter,
}

impl ExplainMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let results_total = IntCounterVec::new(
            Opts::new("explain_results_total", "Explain plans recorded by status"),
            &["status"],
        )?;
        registry.register(Box::new(results_total.clone()))?;

        let in_flight = IntGauge::new("explain_in_flight", "Explain fetches currently running")?;
        registry.register(Box::new(in_flight.clone()))?;

        let dropped_total = IntCounter::new(
            "explain_queue_dropped_total",
            "Explain requests dropped because the queue was full",
        )?;
        registry.register(Box::new(dropped_total.clone()))?;

        Ok(Self {
            results_total,
            in_flight,
            dropped_total,
        })
    }
}

#[derive(Clone)]
struct BatchMetrics {
    events_total: IntCounterVec,
    parse_errors_total: IntCounterVec,
    retries_total: IntCounterVec,
}

impl BatchMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let events_total = IntCounterVec::new(
            Opts::new("log_events_ingested_total", "Slow-log events upserted"),
            &["instance"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let parse_errors_total = IntCounterVec::new(
            Opts::new(
                "log_parse_errors_total",
                "Slow-log entries skipped as unparsable",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(parse_errors_total.clone()))?;

        let retries_total = IntCounterVec::new(
            Opts::new("log_fetch_retries_total", "Log page fetches retried"),
            &["instance"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        Ok(Self {
            events_total,
            parse_errors_total,
            retries_total,
        })
    }
}

#[derive(Clone)]
struct JobMetrics {
    finished_total: IntCounterVec,
    digest_stats: IntGaugeVec,
}

impl JobMetrics {
    fn register(registry: &Registry) -> Result<Self> {
        let finished_total = IntCounterVec::new(
            Opts::new("jobs_finished_total", "Collection jobs by terminal status"),
            &["kind", "status"],
        )?;
        registry.register(Box::new(finished_total.clone()))?;

        let digest_stats = IntGaugeVec::new(
            Opts::new("digest_stats_rows", "Digest statistics stored per period"),
            &["period"],
        )?;
        registry.register(Box::new(digest_stats.clone()))?;

        Ok(Self {
            finished_total,
            digest_stats,
        })
    }
}
