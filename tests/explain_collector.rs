mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{FakeTarget, eventually, explain_collector, instance, registry_with};
use slowmon::error::CollectError;
use slowmon::explain::{ExplainOutcome, ExplainRequest};
use slowmon::jobs::{JobStatus, JobTracker};
use slowmon::model::{PlanStatus, ProcessKey, REASON_MANUAL_REVIEW, REASON_QUERY_COMPLETED, SlowQueryRecord};
use slowmon::normalize::normalize;
use slowmon::store::{MemoryStore, SlowQueryStore};

fn request(pid: u64, sql: &str) -> ExplainRequest {
    ExplainRequest {
        instance: instance("a"),
        pid,
        database: Some("shop".to_string()),
        sql_text: sql.to_string(),
        force: false,
    }
}

async fn seed_live(store: &MemoryStore, pid: u64, sql: &str) {
    let normalized = normalize(sql);
    store
        .upsert_live_query(SlowQueryRecord {
            pid,
            instance_id: "a".to_string(),
            database: Some("shop".to_string()),
            user: "app".to_string(),
            host: "10.0.0.7".to_string(),
            exec_time_secs: 4,
            sql_text: sql.to_string(),
            normalized_sql: normalized.text,
            digest: normalized.digest,
            query_type: normalized.query_type,
            start: Utc::now(),
            end: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_fetches_never_exceed_the_cap() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    target.set_explain_delay(Duration::from_millis(20));
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        2,
        Duration::from_secs(5),
    );

    let mut handles = Vec::new();
    for pid in 1..=10 {
        target.set_running("a", pid, true);
        let collector = collector.clone();
        handles.push(tokio::spawn(async move {
            collector.explain(request(pid, "SELECT * FROM orders")).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.plan().status, PlanStatus::Success);
    }

    assert_eq!(target.explain_calls(), 10);
    assert!(target.peak_in_flight() <= 2, "peak {}", target.peak_in_flight());
}

#[tokio::test]
async fn query_that_finishes_while_waiting_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    let gate = target.gate_explains();
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        1,
        Duration::from_secs(5),
    );

    // Occupy the only slot.
    target.set_running("a", 1, true);
    let blocker = {
        let collector = collector.clone();
        tokio::spawn(async move { collector.explain(request(1, "SELECT SLEEP(5)")).await })
    };
    let watched = target.clone();
    assert!(
        eventually(move || {
            let watched = watched.clone();
            async move { watched.in_flight() == 1 }
        })
        .await
    );

    target.set_running("a", 999_999_999, true);
    let waiting = {
        let collector = collector.clone();
        tokio::spawn(async move {
            collector
                .explain(request(999_999_999, "SELECT * FROM orders WHERE id = 1"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The statement completes before a slot frees up.
    target.set_running("a", 999_999_999, false);
    gate.add_permits(1);

    let outcome = waiting.await.unwrap().unwrap();
    let plan = outcome.plan();
    assert_eq!(plan.status, PlanStatus::Skipped);
    assert_eq!(plan.reason.as_deref(), Some(REASON_QUERY_COMPLETED));
    assert!(plan.json_plan.is_none());

    let stored = store
        .find_explain_plan(ProcessKey::new("a", 999_999_999))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, PlanStatus::Skipped);

    assert_eq!(
        blocker.await.unwrap().unwrap().plan().status,
        PlanStatus::Success
    );
    assert_eq!(target.explain_calls(), 1);
}

#[tokio::test]
async fn existing_plan_is_returned_unless_forced() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    target.set_running("a", 7, true);
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        1,
        Duration::from_secs(5),
    );

    let first = collector.explain(request(7, "SELECT 1")).await.unwrap();
    assert!(matches!(first, ExplainOutcome::Stored(_)));

    let second = collector.explain(request(7, "SELECT 1")).await.unwrap();
    assert!(matches!(second, ExplainOutcome::Existing(_)));
    assert_eq!(target.explain_calls(), 1);

    let mut forced = request(7, "SELECT 1");
    forced.force = true;
    let third = collector.explain(forced).await.unwrap();
    assert!(matches!(third, ExplainOutcome::Stored(_)));
    assert_eq!(target.explain_calls(), 2);
}

#[tokio::test]
async fn writes_are_left_for_manual_review() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    target.set_running("a", 3, true);
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        1,
        Duration::from_secs(5),
    );

    for (pid, sql) in [
        (3, "UPDATE orders SET status = 'x' WHERE id = 1"),
        (4, "SELECT id INTO @id FROM orders LIMIT 1"),
    ] {
        let outcome = collector.explain(request(pid, sql)).await.unwrap();
        assert_eq!(outcome.plan().status, PlanStatus::Skipped);
        assert_eq!(outcome.plan().reason.as_deref(), Some(REASON_MANUAL_REVIEW));
    }
    assert_eq!(target.explain_calls(), 0);
}

#[tokio::test]
async fn fetch_past_the_deadline_is_recorded_as_failed() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    target.set_running("a", 5, true);
    target.set_explain_delay(Duration::from_millis(500));
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        1,
        Duration::from_millis(30),
    );

    let outcome = collector.explain(request(5, "SELECT SLEEP(100)")).await.unwrap();
    assert_eq!(outcome.plan().status, PlanStatus::Failed);
    assert!(
        outcome
            .plan()
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("timed out")),
        "{:?}",
        outcome.plan().reason
    );
}

#[tokio::test]
async fn deadline_covers_the_liveness_check_and_the_explain_together() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    target.set_running("a", 6, true);
    // Each round trip fits the deadline on its own; together they do not.
    target.set_liveness_delay(Duration::from_millis(150));
    target.set_explain_delay(Duration::from_millis(150));
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        1,
        Duration::from_millis(200),
    );

    let started = Instant::now();
    let outcome = collector.explain(request(6, "SELECT * FROM orders")).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.plan().status, PlanStatus::Failed);
    assert!(
        outcome
            .plan()
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("timed out")),
        "{:?}",
        outcome.plan().reason
    );
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    assert_eq!(target.explain_calls(), 1);
}

#[tokio::test]
async fn on_demand_explain_requires_a_recorded_process() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        1,
        Duration::from_secs(5),
    );

    let missing = collector
        .explain_process(ProcessKey::new("a", 404), false)
        .await;
    assert!(matches!(missing, Err(CollectError::NotFound(_))));

    seed_live(&store, 21, "SELECT * FROM orders WHERE id = 9").await;
    target.set_running("a", 21, true);
    let outcome = collector
        .explain_process(ProcessKey::new("a", 21), false)
        .await
        .unwrap();
    let plan = outcome.plan();
    assert_eq!(plan.status, PlanStatus::Success);
    assert!(plan.markdown.as_deref().is_some_and(|md| md.contains("orders")));
}

#[tokio::test]
async fn explain_batch_is_tracked_as_a_job() {
    let store = Arc::new(MemoryStore::new());
    let registry = registry_with(store.clone(), &["a"]).await;
    let target = FakeTarget::new();
    let (collector, _worker) = explain_collector(
        target.clone(),
        store.clone(),
        registry,
        2,
        Duration::from_secs(5),
    );
    let jobs = JobTracker::new();

    target.set_running("a", 1, true);
    let requests = vec![
        request(1, "SELECT * FROM orders"),
        // Not running any more: skipped, which still counts as handled.
        request(2, "SELECT * FROM customers"),
    ];
    let job_id = collector.submit_batch(&jobs, requests).await;
    let job = jobs.wait(&job_id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress.succeeded, 2);
    assert_eq!(job.progress.failed, 0);
    assert_eq!(job.progress.percent, 100.0);
    assert_eq!(target.explain_calls(), 1);
}
