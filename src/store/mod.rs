//! Narrow persistence capability used by every collector.
//!
//! All writes are upserts keyed by a natural key, so a duplicated or retried write is
//! always safe. [`MemoryStore`] is the bundled implementation; anything that can honour
//! the same keys can stand in for it.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::CollectResult;
use crate::model::{DigestStats, ExplainPlan, Instance, LogSlowQueryEvent, ProcessKey, SlowQueryRecord};

mod memory;

pub use memory::{MemoryStore, StoreSnapshot};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = CollectResult<T>> + Send + 'a>>;

/// Outcome of a bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertSummary {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

pub trait SlowQueryStore: Send + Sync {
    /// Replace the instance collection; instances not in `instances` are removed.
    fn replace_instances(&self, instances: Vec<Instance>) -> StoreFuture<'_, ()>;

    fn list_instances(&self) -> StoreFuture<'_, Vec<Instance>>;

    /// Insert or merge a live record keyed by (instance, pid). Returns the stored value.
    fn upsert_live_query(&self, record: SlowQueryRecord) -> StoreFuture<'_, SlowQueryRecord>;

    /// Stamp the end of a live query. Returns `false` when no record exists.
    fn mark_query_ended(
        &self,
        key: ProcessKey,
        end: DateTime<Utc>,
        exec_time_secs: u64,
    ) -> StoreFuture<'_, bool>;

    fn find_live_query(&self, key: ProcessKey) -> StoreFuture<'_, Option<SlowQueryRecord>>;

    fn live_queries_for(&self, instance_id: String) -> StoreFuture<'_, Vec<SlowQueryRecord>>;

    fn find_explain_plan(&self, key: ProcessKey) -> StoreFuture<'_, Option<ExplainPlan>>;

    fn upsert_explain_plan(&self, plan: ExplainPlan) -> StoreFuture<'_, ()>;

    fn bulk_upsert_log_events(
        &self,
        events: Vec<LogSlowQueryEvent>,
    ) -> StoreFuture<'_, UpsertSummary>;

    /// Events whose `event_date` falls in `[from, until)`.
    fn log_events_between(
        &self,
        from: NaiveDate,
        until: NaiveDate,
    ) -> StoreFuture<'_, Vec<LogSlowQueryEvent>>;

    /// Swap every stat of `period` for `stats` in one step.
    fn replace_digest_stats(&self, period: String, stats: Vec<DigestStats>)
    -> StoreFuture<'_, ()>;

    fn digest_stats(&self, period: String) -> StoreFuture<'_, Vec<DigestStats>>;
}
