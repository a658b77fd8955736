use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{SlowQueryStore, StoreFuture, UpsertSummary};
use crate::model::{
    DigestStats, ExplainPlan, Instance, LogEventKey, LogSlowQueryEvent, ProcessKey,
    SlowQueryRecord,
};

#[derive(Default)]
struct Collections {
    instances: BTreeMap<String, Instance>,
    live_queries: HashMap<ProcessKey, SlowQueryRecord>,
    explain_plans: HashMap<ProcessKey, ExplainPlan>,
    log_events: BTreeMap<LogEventKey, LogSlowQueryEvent>,
    digest_stats: BTreeMap<String, Vec<DigestStats>>,
}

/// Serializable image of every collection, used for on-disk snapshots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub live_queries: Vec<SlowQueryRecord>,
    #[serde(default)]
    pub explain_plans: Vec<ExplainPlan>,
    #[serde(default)]
    pub log_events: Vec<LogSlowQueryEvent>,
    #[serde(default)]
    pub digest_stats: BTreeMap<String, Vec<DigestStats>>,
}

/// In-process document store. Cloning shares the underlying collections.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let guard = self.inner.read().await;
        let mut live_queries: Vec<_> = guard.live_queries.values().cloned().collect();
        live_queries.sort_by(|a, b| a.key().cmp(&b.key()));
        let mut explain_plans: Vec<_> = guard.explain_plans.values().cloned().collect();
        explain_plans.sort_by(|a, b| a.key().cmp(&b.key()));

        StoreSnapshot {
            instances: guard.instances.values().cloned().collect(),
            live_queries,
            explain_plans,
            log_events: guard.log_events.values().cloned().collect(),
            digest_stats: guard.digest_stats.clone(),
        }
    }

    pub async fn restore(&self, snapshot: StoreSnapshot) {
        let mut guard = self.inner.write().await;
        guard.instances = snapshot
            .instances
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();
        guard.live_queries = snapshot
            .live_queries
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        guard.explain_plans = snapshot
            .explain_plans
            .into_iter()
            .map(|p| (p.key(), p))
            .collect();
        guard.log_events = snapshot
            .log_events
            .into_iter()
            .map(|e| (e.key(), e))
            .collect();
        guard.digest_stats = snapshot.digest_stats;
    }

    pub async fn live_query_count(&self) -> usize {
        self.inner.read().await.live_queries.len()
    }

    pub async fn log_event_count(&self) -> usize {
        self.inner.read().await.log_events.len()
    }

    pub async fn log_events_for(&self, instance_id: &str) -> Vec<LogSlowQueryEvent> {
        self.inner
            .read()
            .await
            .log_events
            .values()
            .filter(|e| e.instance_id == instance_id)
            .cloned()
            .collect()
    }
}

impl SlowQueryStore for MemoryStore {
    fn replace_instances(&self, instances: Vec<Instance>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.inner.write().await;
            guard.instances = instances.into_iter().map(|i| (i.id.clone(), i)).collect();
            Ok(())
        })
    }

    fn list_instances(&self) -> StoreFuture<'_, Vec<Instance>> {
        Box::pin(async move { Ok(self.inner.read().await.instances.values().cloned().collect()) })
    }

    fn upsert_live_query(&self, record: SlowQueryRecord) -> StoreFuture<'_, SlowQueryRecord> {
        Box::pin(async move {
            let mut guard = self.inner.write().await;
            let stored = guard
                .live_queries
                .entry(record.key())
                .and_modify(|existing| existing.merge(record.clone()))
                .or_insert(record);
            Ok(stored.clone())
        })
    }

    fn mark_query_ended(
        &self,
        key: ProcessKey,
        end: DateTime<Utc>,
        exec_time_secs: u64,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut guard = self.inner.write().await;
            let Some(record) = guard.live_queries.get_mut(&key) else {
                return Ok(false);
            };
            record.end = Some(record.end.map_or(end, |current| current.max(end)));
            record.exec_time_secs = record.exec_time_secs.max(exec_time_secs);
            Ok(true)
        })
    }

    fn find_live_query(&self, key: ProcessKey) -> StoreFuture<'_, Option<SlowQueryRecord>> {
        Box::pin(async move { Ok(self.inner.read().await.live_queries.get(&key).cloned()) })
    }

    fn live_queries_for(&self, instance_id: String) -> StoreFuture<'_, Vec<SlowQueryRecord>> {
        Box::pin(async move {
            let guard = self.inner.read().await;
            let mut rows: Vec<_> = guard
                .live_queries
                .values()
                .filter(|r| r.instance_id == instance_id)
                .cloned()
                .collect();
            rows.sort_by(|a, b| b.start.cmp(&a.start));
            Ok(rows)
        })
    }

    fn find_explain_plan(&self, key: ProcessKey) -> StoreFuture<'_, Option<ExplainPlan>> {
        Box::pin(async move { Ok(self.inner.read().await.explain_plans.get(&key).cloned()) })
    }

    fn upsert_explain_plan(&self, plan: ExplainPlan) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.inner.write().await.explain_plans.insert(plan.key(), plan);
            Ok(())
        })
    }

    fn bulk_upsert_log_events(
        &self,
        events: Vec<LogSlowQueryEvent>,
    ) -> StoreFuture<'_, UpsertSummary> {
        Box::pin(async move {
            let mut guard = self.inner.write().await;
            let mut summary = UpsertSummary::default();
            for event in events {
                if guard.log_events.insert(event.key(), event).is_some() {
                    summary.updated += 1;
                } else {
                    summary.inserted += 1;
                }
            }
            Ok(summary)
        })
    }

    fn log_events_between(
        &self,
        from: NaiveDate,
        until: NaiveDate,
    ) -> StoreFuture<'_, Vec<LogSlowQueryEvent>> {
        Box::pin(async move {
            let guard = self.inner.read().await;
            Ok(guard
                .log_events
                .values()
                .filter(|e| e.event_date >= from && e.event_date < until)
                .cloned()
                .collect())
        })
    }

    fn replace_digest_stats(
        &self,
        period: String,
        stats: Vec<DigestStats>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.inner.write().await;
            if stats.is_empty() {
                guard.digest_stats.remove(&period);
            } else {
                guard.digest_stats.insert(period, stats);
            }
            Ok(())
        })
    }

    fn digest_stats(&self, period: String) -> StoreFuture<'_, Vec<DigestStats>> {
        Box::pin(async move {
            Ok(self
                .inner
                .read()
                .await
                .digest_stats
                .get(&period)
                .cloned()
                .unwrap_or_default())
        })
    }
}
