//! Execution-plan capture for live slow queries.
//!
//! Every fetch holds a permit from one shared semaphore, so no more than
//! `explain.max_concurrency` plans are in flight at once whether the request came from
//! the live poller's queue, an on-demand call, or a tracked batch. Requests wait for a
//! permit, then re-check that the query is still running before touching the server.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::ExplainConfig;
use crate::db::TargetDatabase;
use crate::error::{CollectError, CollectResult};
use crate::jobs::{JobKind, JobTracker, TargetError};
use crate::metrics::AppMetrics;
use crate::model::{
    ExplainPlan, Instance, PlanStatus, ProcessKey, REASON_MANUAL_REVIEW, REASON_QUERY_COMPLETED,
};
use crate::normalize;
use crate::registry::InstanceRegistry;
use crate::store::SlowQueryStore;

pub mod markdown;

/// A plan to capture for one live process.
#[derive(Debug, Clone)]
pub struct ExplainRequest {
    pub instance: Instance,
    pub pid: u64,
    pub database: Option<String>,
    pub sql_text: String,
    /// Overwrite an existing plan instead of returning it.
    pub force: bool,
}

impl ExplainRequest {
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.instance.id.clone(), self.pid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "plan", rename_all = "snake_case")]
pub enum ExplainOutcome {
    /// A new plan (success, skipped or failed) was written.
    Stored(ExplainPlan),
    /// A plan already existed and `force` was not set.
    Existing(ExplainPlan),
}

impl ExplainOutcome {
    pub fn plan(&self) -> &ExplainPlan {
        match self {
            ExplainOutcome::Stored(plan) | ExplainOutcome::Existing(plan) => plan,
        }
    }
}

/// Only plain reads are explained; statements that write or spill into variables need a
/// human to look at them.
pub fn is_explainable(sql: &str) -> bool {
    let text = normalize::normalize_text(sql);
    let mut words = text
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty());
    let starts_with_select = words
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("SELECT"));
    starts_with_select && !words.any(|w| w.eq_ignore_ascii_case("INTO"))
}

struct InFlight {
    metrics: AppMetrics,
}

impl InFlight {
    fn enter(metrics: &AppMetrics) -> Self {
        metrics.explain_in_flight(1);
        Self {
            metrics: metrics.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.metrics.explain_in_flight(-1);
    }
}

struct CollectorInner {
    target: Arc<dyn TargetDatabase>,
    store: Arc<dyn SlowQueryStore>,
    registry: InstanceRegistry,
    metrics: AppMetrics,
    permits: Arc<Semaphore>,
    deadline: Duration,
    queue: mpsc::Sender<ExplainRequest>,
}

#[derive(Clone)]
pub struct ExplainCollector {
    inner: Arc<CollectorInner>,
}

/// Drains the queue filled by the live poller.
pub struct ExplainWorker {
    collector: ExplainCollector,
    queue: mpsc::Receiver<ExplainRequest>,
}

impl ExplainCollector {
    pub fn new(
        target: Arc<dyn TargetDatabase>,
        store: Arc<dyn SlowQueryStore>,
        registry: InstanceRegistry,
        metrics: AppMetrics,
        config: &ExplainConfig,
    ) -> (Self, ExplainWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let collector = Self {
            inner: Arc::new(CollectorInner {
                target,
                store,
                registry,
                metrics,
                permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                deadline: config.deadline,
                queue: tx,
            }),
        };
        let worker = ExplainWorker {
            collector: collector.clone(),
            queue: rx,
        };
        (collector, worker)
    }

    /// Queue a request without waiting. Returns `false` when the queue is full.
    pub fn enqueue(&self, request: ExplainRequest) -> bool {
        match self.inner.queue.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(process = %request.key(), "explain queue full; dropping request");
                self.inner.metrics.inc_explain_dropped();
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                warn!(process = %request.key(), "explain worker stopped; dropping request");
                false
            }
        }
    }

    async fn acquire(&self) -> CollectResult<OwnedSemaphorePermit> {
        self.inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CollectError::fatal("explain semaphore closed"))
    }

    /// Capture a plan now, waiting for a free slot under the concurrency cap.
    pub async fn explain(&self, request: ExplainRequest) -> CollectResult<ExplainOutcome> {
        if !request.force {
            if let Some(existing) = self.inner.store.find_explain_plan(request.key()).await? {
                return Ok(ExplainOutcome::Existing(existing));
            }
        }
        let permit = self.acquire().await?;
        self.process(request, permit).await
    }

    /// On-demand capture for a process already recorded by the live poller.
    pub async fn explain_process(
        &self,
        key: ProcessKey,
        force: bool,
    ) -> CollectResult<ExplainOutcome> {
        let request = self.request_for(key, force).await?;
        self.explain(request).await
    }

    /// Build a request from the stored live record. A plan is only ever captured for a
    /// process the poller has recorded.
    pub async fn request_for(&self, key: ProcessKey, force: bool) -> CollectResult<ExplainRequest> {
        let record = self
            .inner
            .store
            .find_live_query(key.clone())
            .await?
            .ok_or_else(|| CollectError::not_found(format!("no slow query recorded for {key}")))?;
        let instance = self
            .inner
            .registry
            .find(&key.instance_id)
            .await
            .ok_or_else(|| CollectError::not_found(format!("unknown instance {}", key.instance_id)))?;

        Ok(ExplainRequest {
            instance,
            pid: record.pid,
            database: record.database,
            sql_text: record.sql_text,
            force,
        })
    }

    async fn process(
        &self,
        request: ExplainRequest,
        permit: OwnedSemaphorePermit,
    ) -> CollectResult<ExplainOutcome> {
        if !request.force {
            if let Some(existing) = self.inner.store.find_explain_plan(request.key()).await? {
                return Ok(ExplainOutcome::Existing(existing));
            }
        }

        let plan = if is_explainable(&request.sql_text) {
            let _in_flight = InFlight::enter(&self.inner.metrics);
            let plan = self.fetch(&request).await;
            drop(permit);
            plan
        } else {
            drop(permit);
            self.plan_for(&request, PlanStatus::Skipped, Some(REASON_MANUAL_REVIEW.into()))
        };

        self.inner.metrics.inc_explain_result(plan.status.as_str());
        self.inner.store.upsert_explain_plan(plan.clone()).await?;
        info!(
            process = %request.key(),
            status = plan.status.as_str(),
            reason = plan.reason.as_deref().unwrap_or(""),
            "explain plan recorded"
        );
        Ok(ExplainOutcome::Stored(plan))
    }

    fn plan_for(
        &self,
        request: &ExplainRequest,
        status: PlanStatus,
        reason: Option<String>,
    ) -> ExplainPlan {
        ExplainPlan {
            pid: request.pid,
            instance_id: request.instance.id.clone(),
            database: request.database.clone(),
            sql_text: request.sql_text.clone(),
            json_plan: None,
            tree_plan: None,
            markdown: None,
            status,
            reason,
            created_at: Utc::now(),
        }
    }

    fn completed(&self, request: &ExplainRequest) -> ExplainPlan {
        self.plan_for(request, PlanStatus::Skipped, Some(REASON_QUERY_COMPLETED.into()))
    }

    async fn still_running(&self, request: &ExplainRequest) -> CollectResult<bool> {
        match self
            .inner
            .target
            .is_running(&request.instance, request.pid)
            .await
        {
            Err(CollectError::NotFound(_)) => Ok(false),
            other => other,
        }
    }

    /// Every round trip of one fetch shares a single deadline.
    async fn fetch(&self, request: &ExplainRequest) -> ExplainPlan {
        let deadline = self.inner.deadline;
        match time::timeout(deadline, self.capture(request)).await {
            Ok(plan) => plan,
            Err(_) => self.plan_for(
                request,
                PlanStatus::Failed,
                Some(CollectError::Timeout(deadline).to_string()),
            ),
        }
    }

    async fn capture(&self, request: &ExplainRequest) -> ExplainPlan {
        match self.still_running(request).await {
            Ok(true) => {}
            Ok(false) => return self.completed(request),
            Err(err) => return self.plan_for(request, PlanStatus::Failed, Some(err.to_string())),
        }

        let fetched = self
            .inner
            .target
            .explain(
                &request.instance,
                request.database.as_deref(),
                &request.sql_text,
            )
            .await;
        match fetched {
            Ok(output) => {
                let mut plan = self.plan_for(request, PlanStatus::Success, None);
                plan.markdown = Some(markdown::render(&output.json));
                plan.json_plan = Some(output.json);
                plan.tree_plan = Some(output.tree);
                plan
            }
            Err(CollectError::NotFound(_)) => self.completed(request),
            Err(err) => {
                // The statement may have finished while the plan was being fetched.
                if matches!(self.still_running(request).await, Ok(false)) {
                    debug!(process = %request.key(), error = %err, "query ended during explain");
                    self.completed(request)
                } else {
                    self.plan_for(request, PlanStatus::Failed, Some(err.to_string()))
                }
            }
        }
    }

    /// Capture plans for `requests` as a tracked `live-explain-batch` job. Returns the job id
    /// immediately; progress is published through the tracker.
    pub async fn submit_batch(&self, jobs: &JobTracker, requests: Vec<ExplainRequest>) -> String {
        let ticket = jobs.create(JobKind::LiveExplainBatch, requests.len()).await;
        let collector = self.clone();
        let jobs = jobs.clone();
        let job_id = ticket.id.clone();
        tokio::spawn(async move {
            collector.run_batch(jobs, ticket.id, ticket.cancel, requests).await;
        });
        job_id
    }

    async fn run_batch(
        &self,
        jobs: JobTracker,
        job_id: String,
        cancel: tokio_util::sync::CancellationToken,
        requests: Vec<ExplainRequest>,
    ) {
        if let Err(err) = jobs.start(&job_id).await {
            warn!(job_id = %job_id, error = %err, "explain batch not started");
            return;
        }

        let mut tasks = JoinSet::new();
        for request in requests {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.acquire() => permit,
            };
            if cancel.is_cancelled() {
                break;
            }
            if let Err(err) = jobs.target_started(&job_id).await {
                warn!(job_id = %job_id, error = %err, "could not record target start");
            }
            let collector = self.clone();
            let jobs = jobs.clone();
            let job_id = job_id.clone();
            tasks.spawn(async move {
                let key = request.key();
                let result = match permit {
                    Ok(permit) => collector.process(request, permit).await,
                    Err(err) => Err(err),
                };
                let update = match result {
                    Ok(outcome) if outcome.plan().status != PlanStatus::Failed => {
                        jobs.target_succeeded(&job_id).await
                    }
                    Ok(outcome) => {
                        let reason = outcome.plan().reason.clone().unwrap_or_default();
                        jobs.target_failed(
                            &job_id,
                            TargetError::new(key.to_string(), &CollectError::data(reason)),
                        )
                        .await
                    }
                    Err(err) => {
                        jobs.target_failed(&job_id, TargetError::new(key.to_string(), &err))
                            .await
                    }
                };
                if let Err(err) = update {
                    warn!(job_id = %job_id, error = %err, "failed to record explain progress");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                let error = CollectError::fatal(err.to_string());
                if let Err(err) = jobs
                    .target_failed(&job_id, TargetError::new("explain-task", &error))
                    .await
                {
                    warn!(job_id = %job_id, error = %err, "failed to record explain panic");
                }
            }
        }

        if let Err(err) = jobs.finish(&job_id).await {
            warn!(job_id = %job_id, error = %err, "failed to finish explain batch");
        }
    }
}

impl ExplainWorker {
    /// Serve queued requests until the task is aborted.
    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();
        while let Some(request) = self.queue.recv().await {
            while tasks.try_join_next().is_some() {}

            let permit = match self.collector.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    warn!(error = %err, "explain worker stopping");
                    break;
                }
            };
            let collector = self.collector.clone();
            tasks.spawn(async move {
                let key = request.key();
                if let Err(err) = collector.process(request, permit).await {
                    warn!(process = %key, error = %err, "explain request failed");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
