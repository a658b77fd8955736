use slowmon::error::CollectError;
use slowmon::jobs::{JobError, JobKind, JobStatus, JobTracker, TargetError};

#[tokio::test]
async fn events_follow_the_job_lifecycle() {
    let jobs = JobTracker::new();
    let mut events = jobs.subscribe();

    let ticket = jobs.create(JobKind::LogBatch, 2).await;
    assert!(ticket.id.starts_with("log-batch-"));
    jobs.start(&ticket.id).await.unwrap();
    jobs.target_started(&ticket.id).await.unwrap();
    jobs.target_started(&ticket.id).await.unwrap();
    jobs.add_items(&ticket.id, 40).await.unwrap();
    jobs.target_succeeded(&ticket.id).await.unwrap();
    jobs.target_failed(
        &ticket.id,
        TargetError::new("c", &CollectError::throttling("Rate exceeded")),
    )
    .await
    .unwrap();
    let finished = jobs.finish(&ticket.id).await.unwrap();

    assert_eq!(finished.status, JobStatus::Partial);
    assert_eq!(finished.progress.items, 40);
    assert_eq!(finished.progress.in_flight, 0);
    assert_eq!(finished.progress.percent, 100.0);
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, ticket.id);
        statuses.push(event.status);
    }
    assert_eq!(statuses.first(), Some(&JobStatus::Pending));
    assert_eq!(statuses.last(), Some(&JobStatus::Partial));
    assert_eq!(statuses.len(), 8);
    let first_running = statuses
        .iter()
        .position(|s| *s == JobStatus::Running)
        .unwrap();
    assert!(statuses[..first_running].iter().all(|s| *s == JobStatus::Pending));
}

#[tokio::test]
async fn terminal_jobs_cannot_move() {
    let jobs = JobTracker::new();
    let ticket = jobs.create(JobKind::LogBatch, 1).await;
    jobs.start(&ticket.id).await.unwrap();
    jobs.target_started(&ticket.id).await.unwrap();
    jobs.target_succeeded(&ticket.id).await.unwrap();
    assert_eq!(
        jobs.finish(&ticket.id).await.unwrap().status,
        JobStatus::Completed
    );

    let err = jobs.start(&ticket.id).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Running,
            ..
        }
    ));
    assert!(jobs.finish(&ticket.id).await.is_err());
    assert!(jobs.target_succeeded(&ticket.id).await.is_err());

    // Cancelling a finished job is a no-op.
    let after = jobs.cancel(&ticket.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Completed);
}

#[tokio::test]
async fn status_follows_target_outcomes() {
    let jobs = JobTracker::new();

    let none = jobs.create(JobKind::LiveExplainBatch, 1).await;
    jobs.start(&none.id).await.unwrap();
    jobs.target_started(&none.id).await.unwrap();
    jobs.target_failed(&none.id, TargetError::new("a/1", &CollectError::data("boom")))
        .await
        .unwrap();
    assert_eq!(jobs.finish(&none.id).await.unwrap().status, JobStatus::Failed);

    let all = jobs.create(JobKind::LiveExplainBatch, 1).await;
    jobs.start(&all.id).await.unwrap();
    jobs.target_started(&all.id).await.unwrap();
    jobs.target_succeeded(&all.id).await.unwrap();
    assert_eq!(jobs.finish(&all.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn cancelling_a_pending_job_is_immediate() {
    let jobs = JobTracker::new();
    let ticket = jobs.create(JobKind::LogBatch, 3).await;

    let cancelled = jobs.cancel(&ticket.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(ticket.cancel.is_cancelled());
    assert!(jobs.start(&ticket.id).await.is_err());
}

#[tokio::test]
async fn cancelling_a_running_job_waits_for_the_pipeline() {
    let jobs = JobTracker::new();
    let ticket = jobs.create(JobKind::LogBatch, 2).await;
    jobs.start(&ticket.id).await.unwrap();
    jobs.target_started(&ticket.id).await.unwrap();
    jobs.target_succeeded(&ticket.id).await.unwrap();

    let requested = jobs.cancel(&ticket.id).await.unwrap();
    assert_eq!(requested.status, JobStatus::Running);
    assert!(ticket.cancel.is_cancelled());

    let finished = jobs.finish(&ticket.id).await.unwrap();
    assert_eq!(finished.status, JobStatus::Cancelled);
    assert_eq!(finished.progress.succeeded, 1);
}

#[tokio::test]
async fn wait_returns_once_terminal() {
    let jobs = JobTracker::new();
    let ticket = jobs.create(JobKind::LogBatch, 1).await;

    let waiter = {
        let jobs = jobs.clone();
        let id = ticket.id.clone();
        tokio::spawn(async move { jobs.wait(&id).await })
    };

    jobs.start(&ticket.id).await.unwrap();
    jobs.target_started(&ticket.id).await.unwrap();
    jobs.target_succeeded(&ticket.id).await.unwrap();
    jobs.finish(&ticket.id).await.unwrap();

    let job = waiter.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    assert!(matches!(
        jobs.wait("missing").await,
        Err(JobError::UnknownJob(_))
    ));
}

#[tokio::test]
async fn ids_are_unique_and_listed_newest_first() {
    let jobs = JobTracker::new();
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(jobs.create(JobKind::LogBatch, 1).await.id);
    }
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 5);
    assert_eq!(jobs.list().await.len(), 5);
}

#[tokio::test]
async fn oldest_finished_jobs_are_evicted_past_the_retention_limit() {
    let jobs = JobTracker::with_retention(2);

    let mut finished = Vec::new();
    for _ in 0..3 {
        let ticket = jobs.create(JobKind::LogBatch, 1).await;
        jobs.start(&ticket.id).await.unwrap();
        jobs.target_started(&ticket.id).await.unwrap();
        jobs.target_succeeded(&ticket.id).await.unwrap();
        jobs.finish(&ticket.id).await.unwrap();
        finished.push(ticket.id);
    }
    let running = jobs.create(JobKind::LiveExplainBatch, 1).await;
    jobs.start(&running.id).await.unwrap();

    let pending = jobs.create(JobKind::LogBatch, 1).await;

    assert!(jobs.get(&finished[0]).await.is_none());
    assert!(jobs.get(&finished[1]).await.is_some());
    assert!(jobs.get(&finished[2]).await.is_some());
    assert!(jobs.get(&running.id).await.is_some());
    assert!(jobs.get(&pending.id).await.is_some());
    assert_eq!(jobs.list().await.len(), 4);
    assert!(matches!(
        jobs.wait(&finished[0]).await,
        Err(JobError::UnknownJob(_))
    ));
}
