#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use slowmon::batch::source::{LogPage, LogQuery, LogSource, RawLogEvent, SourceFuture};
use slowmon::config::ExplainConfig;
use slowmon::db::{PlanOutput, ProcessRow, TargetDatabase, TargetFuture};
use slowmon::error::{CollectError, CollectResult};
use slowmon::explain::{ExplainCollector, ExplainWorker};
use slowmon::metrics::AppMetrics;
use slowmon::model::{Instance, InstanceTags};
use slowmon::registry::InstanceRegistry;
use slowmon::store::{MemoryStore, SlowQueryStore};
use tokio::sync::Semaphore;

pub fn instance(id: &str) -> Instance {
    Instance {
        id: id.to_string(),
        host: format!("{id}.cluster.internal"),
        port: 3306,
        region: "ap-northeast-2".to_string(),
        tags: InstanceTags {
            monitoring_enabled: true,
            environment: "prd".to_string(),
            extra: Default::default(),
        },
    }
}

pub fn process_row(pid: u64, user: &str, time_secs: u64, sql: &str) -> ProcessRow {
    ProcessRow {
        pid,
        user: user.to_string(),
        host: "10.0.0.7:40112".to_string(),
        database: Some("shop".to_string()),
        command: "Query".to_string(),
        time_secs,
        state: Some("executing".to_string()),
        info: sql.to_string(),
    }
}

pub async fn registry_with(store: Arc<MemoryStore>, ids: &[&str]) -> InstanceRegistry {
    let registry = InstanceRegistry::new(Some("prd".to_string()), store);
    registry
        .sync(ids.iter().map(|id| instance(id)).collect())
        .await
        .expect("sync registry");
    registry
}

/// Scripted target servers.
#[derive(Default)]
pub struct FakeTarget {
    processlists: Mutex<HashMap<String, VecDeque<CollectResult<Vec<ProcessRow>>>>>,
    running: Mutex<HashSet<(String, u64)>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    explain_delay: Mutex<Duration>,
    liveness_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    explain_calls: AtomicUsize,
}

impl FakeTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_processlist(&self, instance_id: &str, result: CollectResult<Vec<ProcessRow>>) {
        self.processlists
            .lock()
            .unwrap()
            .entry(instance_id.to_string())
            .or_default()
            .push_back(result);
    }

    pub fn set_running(&self, instance_id: &str, pid: u64, running: bool) {
        let mut guard = self.running.lock().unwrap();
        if running {
            guard.insert((instance_id.to_string(), pid));
        } else {
            guard.remove(&(instance_id.to_string(), pid));
        }
    }

    pub fn set_explain_delay(&self, delay: Duration) {
        *self.explain_delay.lock().unwrap() = delay;
    }

    pub fn set_liveness_delay(&self, delay: Duration) {
        *self.liveness_delay.lock().unwrap() = delay;
    }

    /// Every explain blocks until the returned semaphore is given permits.
    pub fn gate_explains(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn explain_calls(&self) -> usize {
        self.explain_calls.load(Ordering::SeqCst)
    }
}

impl TargetDatabase for FakeTarget {
    fn fetch_processlist<'a>(&'a self, instance: &'a Instance) -> TargetFuture<'a, Vec<ProcessRow>> {
        Box::pin(async move {
            self.processlists
                .lock()
                .unwrap()
                .get_mut(&instance.id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(Vec::new()))
        })
    }

    fn is_running<'a>(&'a self, instance: &'a Instance, pid: u64) -> TargetFuture<'a, bool> {
        Box::pin(async move {
            let delay = *self.liveness_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(self
                .running
                .lock()
                .unwrap()
                .contains(&(instance.id.clone(), pid)))
        })
    }

    fn explain<'a>(
        &'a self,
        _instance: &'a Instance,
        _database: Option<&'a str>,
        sql: &'a str,
    ) -> TargetFuture<'a, PlanOutput> {
        Box::pin(async move {
            self.explain_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            let delay = *self.explain_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(PlanOutput {
                json: json!({
                    "query_block": {
                        "select_id": 1,
                        "table": {
                            "table_name": "orders",
                            "access_type": "ALL",
                            "rows_examined_per_scan": 1000,
                            "filtered": "10.00",
                            "cost_info": { "read_cost": "90.00", "prefix_cost": "100.00" }
                        }
                    }
                }),
                tree: format!("-> Table scan on orders  (cost=100.00 rows=1000) /* {sql} */"),
            })
        })
    }
}

pub fn explain_collector(
    target: Arc<FakeTarget>,
    store: Arc<MemoryStore>,
    registry: InstanceRegistry,
    max_concurrency: usize,
    deadline: Duration,
) -> (ExplainCollector, ExplainWorker) {
    let config = ExplainConfig {
        max_concurrency,
        deadline,
        queue_capacity: 64,
    };
    let store: Arc<dyn SlowQueryStore> = store;
    ExplainCollector::new(
        target,
        store,
        registry,
        AppMetrics::new().expect("metrics"),
        &config,
    )
}

/// A slow-log entry in the format MySQL writes.
pub fn slow_log_entry(user: &str, timestamp: i64, query_time: f64, sql: &str) -> String {
    format!(
        "# User@Host: {user}[{user}] @  [10.0.0.5]  Id: 77\n\
         # Query_time: {query_time:.6}  Lock_time: 0.000100 Rows_sent: 1  Rows_examined: 5000\n\
         SET timestamp={timestamp};\n\
         {sql};\n"
    )
}

#[derive(Clone)]
pub enum SourceBehavior {
    /// Pages served in order; the last page repeats its token to end pagination.
    Pages(Vec<Vec<String>>),
    AlwaysThrottle,
    Hang,
    Panic,
}

/// Log source with per-instance scripted behaviour.
#[derive(Default)]
pub struct ScriptedLogSource {
    behaviors: Mutex<HashMap<String, SourceBehavior>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedLogSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, instance_id: &str, behavior: SourceBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), behavior);
    }

    pub fn calls(&self, instance_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }
}

impl LogSource for ScriptedLogSource {
    fn fetch_page<'a>(&'a self, query: &'a LogQuery) -> SourceFuture<'a, LogPage> {
        Box::pin(async move {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(query.instance_id.clone())
                .or_default() += 1;
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(&query.instance_id)
                .cloned()
                .unwrap_or(SourceBehavior::Pages(Vec::new()));

            match behavior {
                SourceBehavior::AlwaysThrottle => {
                    Err(CollectError::throttling("Rate exceeded"))
                }
                SourceBehavior::Hang => {
                    std::future::pending::<()>().await;
                    Ok(LogPage::default())
                }
                SourceBehavior::Panic => panic!("log source for {} blew up", query.instance_id),
                SourceBehavior::Pages(pages) => {
                    let index: usize = query
                        .token
                        .as_deref()
                        .and_then(|t| t.parse().ok())
                        .unwrap_or(0);
                    let events = pages
                        .get(index)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .map(|message| RawLogEvent {
                            timestamp_ms: 0,
                            message,
                        })
                        .collect();
                    let next_token = if index + 1 < pages.len() {
                        Some((index + 1).to_string())
                    } else {
                        query.token.clone()
                    };
                    Ok(LogPage { events, next_token })
                }
            }
        })
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
