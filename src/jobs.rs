//! Collection-job state machine.
//!
//! `pending -> running -> {completed | partial | failed | cancelled}`. The tracker is the
//! only publisher of [`JobEvent`]s; every mutation happens under one write lock and the
//! event is sent before the lock is released, so subscribers see each job's events in
//! the order the transitions happened.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::CollectError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Finished jobs kept for status queries before the oldest are dropped.
pub const DEFAULT_RETAINED_FINISHED: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    LiveExplainBatch,
    LogBatch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::LiveExplainBatch => "live-explain-batch",
            JobKind::LogBatch => "log-batch",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Partial => "partial",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            _ => 2,
        }
    }

    /// Transitions only move forward and never leave a terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_targets: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub in_flight: usize,
    /// Documents written so far across all targets.
    pub items: u64,
    pub percent: f64,
}

impl JobProgress {
    fn new(total_targets: usize) -> Self {
        Self {
            total_targets,
            ..Self::default()
        }
    }

    fn refresh_percent(&mut self) {
        self.percent = if self.total_targets == 0 {
            0.0
        } else {
            let done = (self.succeeded + self.failed) as f64;
            (done / self.total_targets as f64 * 100.0).min(100.0)
        };
    }
}

/// Failure detail for one target of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetError {
    pub target: String,
    pub kind: String,
    pub message: String,
}

impl TargetError {
    pub fn new(target: impl Into<String>, error: &CollectError) -> Self {
        Self {
            target: target.into(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionJob {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub errors: Vec<TargetError>,
}

/// Published on every job mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub errors: Vec<TargetError>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    fn from_job(job: &CollectionJob) -> Self {
        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            status: job.status,
            progress: job.progress.clone(),
            errors: job.errors.clone(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("unknown job `{0}`")]
    UnknownJob(String),

    #[error("job `{id}` cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// What a pipeline needs to drive a freshly created job.
#[derive(Debug, Clone)]
pub struct JobTicket {
    pub id: String,
    pub cancel: CancellationToken,
}

struct JobEntry {
    job: CollectionJob,
    cancel: CancellationToken,
}

struct TrackerInner {
    jobs: RwLock<HashMap<String, JobEntry>>,
    events: broadcast::Sender<JobEvent>,
    sequence: AtomicU64,
    retained_finished: usize,
}

#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_FINISHED)
    }

    /// Keep at most `retained_finished` terminal jobs. Pending and running jobs are never
    /// dropped.
    pub fn with_retention(retained_finished: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                jobs: RwLock::new(HashMap::new()),
                events,
                sequence: AtomicU64::new(0),
                retained_finished,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    fn next_id(&self, kind: JobKind) -> String {
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", kind.as_str(), Utc::now().timestamp_millis(), seq)
    }

    fn publish(&self, job: &CollectionJob) {
        // No receivers is fine; the transport may not be attached.
        let _ = self.inner.events.send(JobEvent::from_job(job));
    }

    pub async fn create(&self, kind: JobKind, total_targets: usize) -> JobTicket {
        let id = self.next_id(kind);
        let cancel = CancellationToken::new();
        let job = CollectionJob {
            id: id.clone(),
            kind,
            status: JobStatus::Pending,
            progress: JobProgress::new(total_targets),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            errors: Vec::new(),
        };

        let mut guard = self.inner.jobs.write().await;
        Self::evict_finished(&mut guard, self.inner.retained_finished);
        self.publish(&job);
        guard.insert(
            id.clone(),
            JobEntry {
                job,
                cancel: cancel.clone(),
            },
        );
        info!(job_id = %id, kind = %kind, total_targets, "job created");
        JobTicket { id, cancel }
    }

    fn evict_finished(jobs: &mut HashMap<String, JobEntry>, keep: usize) {
        let mut finished: Vec<(DateTime<Utc>, String)> = jobs
            .values()
            .filter(|entry| entry.job.status.is_terminal())
            .map(|entry| {
                (
                    entry.job.finished_at.unwrap_or(entry.job.created_at),
                    entry.job.id.clone(),
                )
            })
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
            debug!(job_id = %id, "evicted finished job");
        }
    }

    async fn update<F>(&self, id: &str, apply: F) -> Result<CollectionJob, JobError>
    where
        F: FnOnce(&mut CollectionJob) -> Result<(), JobError>,
    {
        let mut guard = self.inner.jobs.write().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| JobError::UnknownJob(id.to_string()))?;
        apply(&mut entry.job)?;
        entry.job.progress.refresh_percent();
        self.publish(&entry.job);
        Ok(entry.job.clone())
    }

    fn transition(job: &mut CollectionJob, next: JobStatus) -> Result<(), JobError> {
        if !job.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: job.id.clone(),
                from: job.status,
                to: next,
            });
        }
        job.status = next;
        let now = Utc::now();
        if next == JobStatus::Running {
            job.started_at = Some(now);
        }
        if next.is_terminal() {
            job.finished_at = Some(now);
        }
        Ok(())
    }

    pub async fn start(&self, id: &str) -> Result<CollectionJob, JobError> {
        self.update(id, |job| Self::transition(job, JobStatus::Running))
            .await
    }

    fn ensure_running(job: &CollectionJob) -> Result<(), JobError> {
        if job.status == JobStatus::Running {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                id: job.id.clone(),
                from: job.status,
                to: JobStatus::Running,
            })
        }
    }

    pub async fn target_started(&self, id: &str) -> Result<CollectionJob, JobError> {
        self.update(id, |job| {
            Self::ensure_running(job)?;
            job.progress.in_flight += 1;
            Ok(())
        })
        .await
    }

    pub async fn add_items(&self, id: &str, items: u64) -> Result<CollectionJob, JobError> {
        self.update(id, |job| {
            Self::ensure_running(job)?;
            job.progress.items += items;
            Ok(())
        })
        .await
    }

    pub async fn target_succeeded(&self, id: &str) -> Result<CollectionJob, JobError> {
        self.update(id, |job| {
            Self::ensure_running(job)?;
            job.progress.in_flight = job.progress.in_flight.saturating_sub(1);
            job.progress.succeeded += 1;
            Ok(())
        })
        .await
    }

    pub async fn target_failed(
        &self,
        id: &str,
        error: TargetError,
    ) -> Result<CollectionJob, JobError> {
        self.update(id, |job| {
            Self::ensure_running(job)?;
            job.progress.in_flight = job.progress.in_flight.saturating_sub(1);
            job.progress.failed += 1;
            job.errors.push(error);
            Ok(())
        })
        .await
    }

    /// A target that stopped at a cancellation checkpoint: neither success nor failure.
    pub async fn target_abandoned(&self, id: &str) -> Result<CollectionJob, JobError> {
        self.update(id, |job| {
            Self::ensure_running(job)?;
            job.progress.in_flight = job.progress.in_flight.saturating_sub(1);
            Ok(())
        })
        .await
    }

    /// Derive and apply the terminal status once every launched target has reported.
    pub async fn finish(&self, id: &str) -> Result<CollectionJob, JobError> {
        let cancelled = self.is_cancelled(id).await?;
        let job = self
            .update(id, |job| {
                let p = &job.progress;
                let next = if cancelled {
                    JobStatus::Cancelled
                } else if p.failed == 0 && p.succeeded > 0 {
                    JobStatus::Completed
                } else if p.succeeded > 0 {
                    JobStatus::Partial
                } else {
                    JobStatus::Failed
                };
                Self::transition(job, next)
            })
            .await?;
        info!(
            job_id = %job.id,
            status = %job.status,
            succeeded = job.progress.succeeded,
            failed = job.progress.failed,
            items = job.progress.items,
            "job finished"
        );
        Ok(job)
    }

    /// Fatal pre-flight error: the job goes straight to `failed`.
    pub async fn fail(&self, id: &str, error: TargetError) -> Result<CollectionJob, JobError> {
        self.update(id, |job| {
            job.errors.push(error);
            Self::transition(job, JobStatus::Failed)
        })
        .await
    }

    /// Request cooperative cancellation. A job that has not started is cancelled on the
    /// spot; a running job is finalized by its pipeline at the next checkpoint.
    pub async fn cancel(&self, id: &str) -> Result<CollectionJob, JobError> {
        let mut guard = self.inner.jobs.write().await;
        let entry = guard
            .get_mut(id)
            .ok_or_else(|| JobError::UnknownJob(id.to_string()))?;
        if entry.job.status.is_terminal() {
            return Ok(entry.job.clone());
        }
        entry.cancel.cancel();
        if entry.job.status == JobStatus::Pending {
            Self::transition(&mut entry.job, JobStatus::Cancelled)?;
            self.publish(&entry.job);
        }
        debug!(job_id = %id, status = %entry.job.status, "cancellation requested");
        Ok(entry.job.clone())
    }

    async fn is_cancelled(&self, id: &str) -> Result<bool, JobError> {
        let guard = self.inner.jobs.read().await;
        guard
            .get(id)
            .map(|entry| entry.cancel.is_cancelled())
            .ok_or_else(|| JobError::UnknownJob(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Option<CollectionJob> {
        self.inner
            .jobs
            .read()
            .await
            .get(id)
            .map(|entry| entry.job.clone())
    }

    pub async fn list(&self) -> Vec<CollectionJob> {
        let mut jobs: Vec<_> = self
            .inner
            .jobs
            .read()
            .await
            .values()
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Block until the job reaches a terminal state.
    pub async fn wait(&self, id: &str) -> Result<CollectionJob, JobError> {
        let mut events = self.subscribe();
        loop {
            let job = self
                .get(id)
                .await
                .ok_or_else(|| JobError::UnknownJob(id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(job),
            }
        }
    }
}
