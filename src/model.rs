use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::QueryType;

/// A monitored database instance as known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub host: String,
    #[serde(default = "Instance::default_port")]
    pub port: u16,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub tags: InstanceTags,
}

impl Instance {
    const fn default_port() -> u16 {
        3306
    }

    pub fn is_monitored(&self) -> bool {
        self.tags.monitoring_enabled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceTags {
    #[serde(default)]
    pub monitoring_enabled: bool,
    #[serde(default)]
    pub environment: String,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Identity of a live query. Thread ids are only unique within one server, so the
/// instance is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessKey {
    pub instance_id: String,
    pub pid: u64,
}

impl ProcessKey {
    pub fn new(instance_id: impl Into<String>, pid: u64) -> Self {
        Self {
            instance_id: instance_id.into(),
            pid,
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.pid)
    }
}

/// A query captured by the live poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryRecord {
    pub pid: u64,
    pub instance_id: String,
    pub database: Option<String>,
    pub user: String,
    pub host: String,
    /// Longest execution time observed, in seconds.
    pub exec_time_secs: u64,
    pub sql_text: String,
    pub normalized_sql: String,
    pub digest: String,
    pub query_type: QueryType,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl SlowQueryRecord {
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.instance_id.clone(), self.pid)
    }

    /// Fold a concurrent or repeated write for the same process into this record.
    ///
    /// The earliest start, the longest duration and the latest end timestamp win, so
    /// the result does not depend on the order the writes arrive in.
    pub fn merge(&mut self, incoming: SlowQueryRecord) {
        if incoming.start < self.start {
            self.start = incoming.start;
        }
        self.exec_time_secs = self.exec_time_secs.max(incoming.exec_time_secs);
        self.end = match (self.end, incoming.end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if self.database.is_none() {
            self.database = incoming.database;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Success,
    Skipped,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Success => "success",
            PlanStatus::Skipped => "skipped",
            PlanStatus::Failed => "failed",
        }
    }
}

pub const REASON_QUERY_COMPLETED: &str = "query completed";
pub const REASON_MANUAL_REVIEW: &str = "manual review required";

/// Execution plan captured for a live slow query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainPlan {
    pub pid: u64,
    pub instance_id: String,
    pub database: Option<String>,
    pub sql_text: String,
    pub json_plan: Option<serde_json::Value>,
    pub tree_plan: Option<String>,
    pub markdown: Option<String>,
    pub status: PlanStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExplainPlan {
    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.instance_id.clone(), self.pid)
    }
}

/// One slow-log entry ingested by the batch collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSlowQueryEvent {
    pub instance_id: String,
    pub event_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub digest: String,
    pub normalized_sql: String,
    pub raw_sql: String,
    pub query_type: QueryType,
    pub user: String,
    pub host: String,
    pub database: Option<String>,
    pub lock_time: f64,
    pub rows_examined: u64,
    pub rows_sent: u64,
    pub query_time: f64,
}

impl LogSlowQueryEvent {
    pub fn key(&self) -> LogEventKey {
        LogEventKey {
            instance_id: self.instance_id.clone(),
            timestamp: self.timestamp.timestamp(),
            digest: self.digest.clone(),
        }
    }
}

/// Idempotency key for batch-ingested events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogEventKey {
    pub instance_id: String,
    pub timestamp: i64,
    pub digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvgStats {
    pub avg_lock_time: f64,
    pub avg_rows_examined: f64,
    pub avg_rows_sent: f64,
    pub avg_time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SumStats {
    pub execution_count: u64,
    pub total_time: f64,
    pub total_lock_time: f64,
    pub total_rows_examined: u64,
    pub total_rows_sent: u64,
}

/// Derived statistics for one (instance, digest, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestStats {
    pub instance_id: String,
    pub digest: String,
    pub digest_query: String,
    pub query_type: QueryType,
    pub period: String,
    pub avg_stats: AvgStats,
    pub sum_stats: SumStats,
}
