//! Retrospective slow-log collection over a date range.
//!
//! One worker per target instance, at most `batch.workers` at a time. Each worker pages
//! through its instance's log window, retrying transient failures per page, and upserts
//! what it parsed under the (instance, timestamp, digest) key, so replaying an
//! overlapping window writes nothing new.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::BatchConfig;
use crate::error::{CollectError, CollectResult};
use crate::jobs::{JobKind, JobTracker, TargetError};
use crate::metrics::AppMetrics;
use crate::model::Instance;
use crate::registry::InstanceRegistry;
use crate::store::SlowQueryStore;

pub mod parser;
pub mod retry;
pub mod source;

use retry::{RetryError, RetryPolicy};
use source::{LogQuery, LogSource};

/// A batch collection request. Both dates are inclusive, in UTC.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(default)]
    pub instance_ids: Option<Vec<String>>,
}

impl BatchRequest {
    pub fn validate(&self, max_range_days: i64) -> CollectResult<()> {
        if self.end_date < self.start_date {
            return Err(CollectError::validation(format!(
                "end_date {} is before start_date {}",
                self.end_date, self.start_date
            )));
        }
        let days = (self.end_date - self.start_date).num_days() + 1;
        if days > max_range_days {
            return Err(CollectError::validation(format!(
                "range of {days} days exceeds the {max_range_days}-day limit"
            )));
        }
        Ok(())
    }
}

enum WorkerOutcome {
    Done { events: u64, skipped: u64 },
    Failed(CollectError),
    Cancelled,
}

#[derive(Clone)]
pub struct LogBatchCollector {
    registry: InstanceRegistry,
    source: Arc<dyn LogSource>,
    store: Arc<dyn SlowQueryStore>,
    jobs: JobTracker,
    metrics: AppMetrics,
    config: Arc<BatchConfig>,
}

impl LogBatchCollector {
    pub fn new(
        registry: InstanceRegistry,
        source: Arc<dyn LogSource>,
        store: Arc<dyn SlowQueryStore>,
        jobs: JobTracker,
        metrics: AppMetrics,
        config: BatchConfig,
    ) -> Self {
        Self {
            registry,
            source,
            store,
            jobs,
            metrics,
            config: Arc::new(config),
        }
    }

    /// Validate, resolve targets and start the run in the background. Returns the job id.
    ///
    /// Invalid ranges fail synchronously without creating a job. A run with no target
    /// creates a job that is immediately `failed` and returns a fatal error naming it.
    pub async fn submit(&self, request: BatchRequest) -> CollectResult<String> {
        request.validate(self.config.max_range_days)?;

        let targets = self.registry.resolve(request.instance_ids.as_deref()).await;
        let ticket = self.jobs.create(JobKind::LogBatch, targets.len()).await;

        if targets.is_empty() {
            let error = CollectError::fatal("no monitored instance matches the request");
            if let Err(err) = self
                .jobs
                .fail(&ticket.id, TargetError::new("registry", &error))
                .await
            {
                warn!(job_id = %ticket.id, error = %err, "failed to mark job failed");
            }
            return Err(CollectError::fatal(format!("job {}: {error}", ticket.id)));
        }

        let collector = self.clone();
        let job_id = ticket.id.clone();
        tokio::spawn(async move {
            collector
                .run(ticket.id, ticket.cancel, targets, request)
                .await;
        });
        Ok(job_id)
    }

    #[instrument(skip_all, fields(job_id = %job_id))]
    async fn run(
        &self,
        job_id: String,
        cancel: CancellationToken,
        targets: Vec<Instance>,
        request: BatchRequest,
    ) {
        if let Err(err) = self.jobs.start(&job_id).await {
            warn!(error = %err, "batch job not started");
            return;
        }

        let start = request.start_date.and_time(NaiveTime::MIN).and_utc();
        let end = (request.end_date + chrono::Days::new(1))
            .and_time(NaiveTime::MIN)
            .and_utc();

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut workers = JoinSet::new();

        for instance in targets {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if cancel.is_cancelled() {
                break;
            }

            if let Err(err) = self.jobs.target_started(&job_id).await {
                warn!(error = %err, "could not record target start");
            }
            let collector = self.clone();
            let cancel = cancel.clone();
            let job_id = job_id.clone();
            workers.spawn(async move {
                let collection = {
                    let collector = collector.clone();
                    let job_id = job_id.clone();
                    let instance = instance.clone();
                    tokio::spawn(async move {
                        collector
                            .collect_instance(&job_id, &instance, start, end, &cancel)
                            .await
                    })
                };
                // A panicking collection is charged to its instance like any other failure.
                let outcome = collection.await.unwrap_or_else(|err| {
                    WorkerOutcome::Failed(CollectError::fatal(format!("worker panicked: {err}")))
                });
                drop(permit);
                collector.record_outcome(&job_id, &instance.id, outcome).await;
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                let error = CollectError::fatal(err.to_string());
                if let Err(err) = self
                    .jobs
                    .target_failed(&job_id, TargetError::new("worker", &error))
                    .await
                {
                    warn!(error = %err, "failed to record worker panic");
                }
            }
        }

        if let Err(err) = self.jobs.finish(&job_id).await {
            warn!(error = %err, "failed to finish batch job");
        }
    }

    /// Workers report their own outcome so progress moves while later targets still
    /// wait for a slot.
    async fn record_outcome(&self, job_id: &str, instance_id: &str, outcome: WorkerOutcome) {
        let update = match outcome {
            WorkerOutcome::Done { events, skipped } => {
                info!(instance = %instance_id, events, skipped, "instance window collected");
                self.jobs.target_succeeded(job_id).await
            }
            WorkerOutcome::Failed(error) => {
                warn!(instance = %instance_id, error = %error, "instance window failed");
                self.jobs
                    .target_failed(job_id, TargetError::new(instance_id, &error))
                    .await
            }
            WorkerOutcome::Cancelled => {
                debug!(instance = %instance_id, "instance worker stopped by cancellation");
                self.jobs.target_abandoned(job_id).await
            }
        };
        if let Err(err) = update {
            warn!(job_id, error = %err, "failed to record worker outcome");
        }
    }

    async fn collect_instance(
        &self,
        job_id: &str,
        instance: &Instance,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        cancel: &CancellationToken,
    ) -> WorkerOutcome {
        let policy = RetryPolicy::from(&self.config.retry);
        let page_timeout = self.config.page_timeout;
        let mut token: Option<String> = None;
        let mut events_total = 0u64;
        let mut skipped_total = 0u64;

        loop {
            if cancel.is_cancelled() {
                return WorkerOutcome::Cancelled;
            }

            let query = LogQuery {
                instance_id: instance.id.clone(),
                start,
                end,
                token: token.clone(),
                limit: self.config.page_size,
            };
            let fetched = policy
                .run(
                    cancel,
                    || async {
                        match time::timeout(page_timeout, self.source.fetch_page(&query)).await {
                            Ok(result) => result,
                            Err(_) => Err(CollectError::Timeout(page_timeout)),
                        }
                    },
                    |_, _| self.metrics.inc_fetch_retry(&instance.id),
                )
                .await;

            let page = match fetched {
                Ok(page) => page,
                Err(RetryError::Cancelled) => return WorkerOutcome::Cancelled,
                Err(RetryError::Exhausted { attempts, error }) => {
                    warn!(instance = %instance.id, attempts, error = %error, "log page fetch gave up");
                    return WorkerOutcome::Failed(error);
                }
            };

            let (batch, skipped) = self.parse_page(instance, page.events);
            skipped_total += skipped;
            if !batch.is_empty() {
                let written = match self.store.bulk_upsert_log_events(batch).await {
                    Ok(summary) => summary,
                    Err(error) => return WorkerOutcome::Failed(error),
                };
                let count = written.total() as u64;
                events_total += count;
                self.metrics.inc_log_events(&instance.id, count);
                if let Err(err) = self.jobs.add_items(job_id, count).await {
                    debug!(error = %err, "could not record items");
                }
            }

            match page.next_token {
                Some(next) if token.as_deref() != Some(next.as_str()) => token = Some(next),
                _ => break,
            }
        }

        WorkerOutcome::Done {
            events: events_total,
            skipped: skipped_total,
        }
    }

    fn parse_page(
        &self,
        instance: &Instance,
        events: Vec<source::RawLogEvent>,
    ) -> (Vec<crate::model::LogSlowQueryEvent>, u64) {
        let mut parsed = Vec::with_capacity(events.len());
        let mut skipped = 0u64;

        for raw in events {
            let entry = match parser::parse_entry(&raw.message) {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(instance = %instance.id, error = %err, "skipping unparsable log entry");
                    skipped += 1;
                    continue;
                }
            };
            let user = entry.user.to_lowercase();
            if self
                .config
                .excluded_users
                .iter()
                .any(|excluded| user.contains(&excluded.to_lowercase()))
            {
                continue;
            }
            match entry.into_event(&instance.id, raw.timestamp_ms) {
                Ok(event) => parsed.push(event),
                Err(err) => {
                    debug!(instance = %instance.id, error = %err, "skipping log entry");
                    skipped += 1;
                }
            }
        }

        self.metrics.inc_parse_errors(&instance.id, skipped);
        (parsed, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(start: &str, end: &str) -> BatchRequest {
        BatchRequest {
            start_date: start.parse().expect("start"),
            end_date: end.parse().expect("end"),
            instance_ids: None,
        }
    }

    #[test]
    fn range_validation() {
        assert!(request("2024-05-01", "2024-05-31").validate(31).is_ok());
        assert!(matches!(
            request("2024-05-01", "2024-06-01").validate(31),
            Err(CollectError::Validation(_))
        ));
        assert!(matches!(
            request("2024-05-02", "2024-05-01").validate(31),
            Err(CollectError::Validation(_))
        ));
    }
}
