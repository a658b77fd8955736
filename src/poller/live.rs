use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::config::PollerConfig;
use crate::db::{ProcessRow, TargetDatabase, filter_slow};
use crate::error::CollectError;
use crate::explain::{ExplainCollector, ExplainRequest};
use crate::metrics::AppMetrics;
use crate::model::{Instance, ProcessKey, SlowQueryRecord};
use crate::normalize;
use crate::store::SlowQueryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveEntry {
    max_time_secs: u64,
}

/// Process ids seen as live-and-slow on the previous tick of one instance.
#[derive(Debug, Default)]
pub struct LiveSet {
    entries: HashMap<u64, LiveEntry>,
}

/// Classification of one tick's slow rows against the previous tick.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LiveDiff {
    pub new: Vec<ProcessRow>,
    pub still_live: Vec<ProcessRow>,
    /// Process ids that left the set, with the longest time observed for each.
    pub ended: Vec<(u64, u64)>,
}

impl LiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, pid: u64) -> bool {
        self.entries.contains_key(&pid)
    }

    /// Classify `rows` against the set without changing it.
    pub fn diff(&self, rows: Vec<ProcessRow>) -> LiveDiff {
        let mut diff = LiveDiff::default();
        let mut seen = HashSet::with_capacity(rows.len());

        for row in rows {
            seen.insert(row.pid);
            if self.entries.contains_key(&row.pid) {
                diff.still_live.push(row);
            } else {
                diff.new.push(row);
            }
        }

        diff.ended = self
            .entries
            .iter()
            .filter(|(pid, _)| !seen.contains(*pid))
            .map(|(pid, entry)| (*pid, entry.max_time_secs))
            .collect();
        diff.ended.sort_unstable();
        diff
    }

    /// Move the set to the state described by `diff`.
    ///
    /// New pids in `unrecorded` stay out of the set so they are reported as new again,
    /// and ended pids in `unmarked` stay in it so they are reported as ended again.
    pub fn advance(&mut self, diff: &LiveDiff, unrecorded: &[u64], unmarked: &[u64]) {
        let mut next = HashMap::with_capacity(diff.new.len() + diff.still_live.len());

        for row in diff.new.iter().chain(&diff.still_live) {
            if unrecorded.contains(&row.pid) {
                continue;
            }
            let max_time_secs = self
                .entries
                .get(&row.pid)
                .map_or(row.time_secs, |prev| prev.max_time_secs.max(row.time_secs));
            next.insert(row.pid, LiveEntry { max_time_secs });
        }

        for (pid, max_time_secs) in &diff.ended {
            if unmarked.contains(pid) {
                next.insert(*pid, LiveEntry { max_time_secs: *max_time_secs });
            }
        }

        self.entries = next;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub new: usize,
    pub still_live: usize,
    pub ended: usize,
}

/// Samples one instance's process list and keeps its live set between ticks.
pub struct LivePoller {
    instance: Instance,
    live: LiveSet,
    target: Arc<dyn TargetDatabase>,
    store: Arc<dyn SlowQueryStore>,
    explain: ExplainCollector,
    metrics: AppMetrics,
    config: PollerConfig,
}

impl LivePoller {
    pub fn new(
        instance: Instance,
        target: Arc<dyn TargetDatabase>,
        store: Arc<dyn SlowQueryStore>,
        explain: ExplainCollector,
        metrics: AppMetrics,
        config: PollerConfig,
    ) -> Self {
        Self {
            instance,
            live: LiveSet::new(),
            target,
            store,
            explain,
            metrics,
            config,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn live_set(&self) -> &LiveSet {
        &self.live
    }

    fn record_for(&self, row: &ProcessRow, now: DateTime<Utc>) -> SlowQueryRecord {
        let sql_text = normalize::squash_whitespace(&row.info);
        let normalized = normalize::normalize(&sql_text);
        SlowQueryRecord {
            pid: row.pid,
            instance_id: self.instance.id.clone(),
            database: row.database.clone(),
            user: row.user.clone(),
            host: row.host.clone(),
            exec_time_secs: row.time_secs,
            sql_text,
            normalized_sql: normalized.text,
            digest: normalized.digest,
            query_type: normalized.query_type,
            start: now - ChronoDuration::seconds(row.time_secs as i64),
            end: None,
        }
    }

    /// One sampling pass. A failed fetch leaves the live set untouched so the next tick
    /// picks up where this one would have. A failed write keeps the affected pid out of
    /// step so the next tick retries it.
    #[instrument(skip_all, fields(instance = %self.instance.id))]
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let timeout = self.config.remote_timeout;
        let rows = match time::timeout(timeout, self.target.fetch_processlist(&self.instance)).await
        {
            Ok(rows) => rows?,
            Err(_) => return Err(CollectError::Timeout(timeout).into()),
        };

        let now = Utc::now();
        let diff = self.live.diff(filter_slow(rows, &self.config));
        let summary = TickSummary {
            new: diff.new.len(),
            still_live: diff.still_live.len(),
            ended: diff.ended.len(),
        };

        let mut failure: Option<CollectError> = None;
        let mut unrecorded = Vec::new();
        for row in &diff.new {
            let record = self.record_for(row, now);
            info!(
                pid = record.pid,
                digest = %record.digest,
                exec_time_secs = record.exec_time_secs,
                "slow query detected"
            );
            match self.store.upsert_live_query(record).await {
                Ok(stored) => {
                    self.explain.enqueue(ExplainRequest {
                        instance: self.instance.clone(),
                        pid: stored.pid,
                        database: stored.database,
                        sql_text: stored.sql_text,
                        force: false,
                    });
                }
                Err(err) => {
                    warn!(pid = row.pid, error = %err, "failed to record slow query");
                    unrecorded.push(row.pid);
                    failure.get_or_insert(err);
                }
            }
        }

        let mut unmarked = Vec::new();
        for (pid, max_time_secs) in &diff.ended {
            let key = ProcessKey::new(self.instance.id.clone(), *pid);
            match self.store.mark_query_ended(key, now, *max_time_secs).await {
                Ok(true) => {}
                Ok(false) => debug!(pid, "ended query has no stored record"),
                Err(err) => {
                    warn!(pid, error = %err, "failed to mark query ended");
                    unmarked.push(*pid);
                    failure.get_or_insert(err);
                }
            }
        }

        self.live.advance(&diff, &unrecorded, &unmarked);
        self.metrics.inc_slow_queries(
            &self.instance.id,
            (summary.new - unrecorded.len()) as u64,
        );
        self.metrics
            .set_live_queries(&self.instance.id, self.live.len());

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pid: u64, time_secs: u64) -> ProcessRow {
        ProcessRow {
            pid,
            user: "app".into(),
            host: "10.0.0.1".into(),
            database: Some("shop".into()),
            command: "Query".into(),
            time_secs,
            state: None,
            info: "SELECT SLEEP(60)".into(),
        }
    }

    fn step(set: &mut LiveSet, rows: Vec<ProcessRow>) -> LiveDiff {
        let diff = set.diff(rows);
        set.advance(&diff, &[], &[]);
        diff
    }

    #[test]
    fn diff_classifies_new_still_live_and_ended() {
        let mut set = LiveSet::new();
        let first = step(&mut set, vec![row(1, 2), row(2, 3)]);
        assert_eq!(first.new.len(), 2);
        assert!(first.ended.is_empty());

        let second = step(&mut set, vec![row(2, 4), row(3, 2)]);
        assert_eq!(second.new.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![3]);
        assert_eq!(second.still_live.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![2]);
        assert_eq!(second.ended, vec![(1, 2)]);

        let third = step(&mut set, Vec::new());
        assert_eq!(third.ended, vec![(2, 4), (3, 2)]);
        assert!(set.is_empty());
    }

    #[test]
    fn unwritten_pids_are_reported_again() {
        let mut set = LiveSet::new();
        let first = set.diff(vec![row(1, 2), row(2, 3)]);
        set.advance(&first, &[2], &[]);
        assert!(set.contains(1));
        assert!(!set.contains(2));

        let second = set.diff(vec![row(2, 5)]);
        assert_eq!(second.new.iter().map(|r| r.pid).collect::<Vec<_>>(), vec![2]);
        assert_eq!(second.ended, vec![(1, 2)]);
        set.advance(&second, &[], &[1]);
        assert!(set.contains(1));

        let third = set.diff(vec![row(2, 6)]);
        assert_eq!(third.ended, vec![(1, 2)]);
        assert_eq!(third.still_live.len(), 1);
    }
}
