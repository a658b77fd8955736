//! Per-period digest statistics.
//!
//! Stats are a pure function of the stored slow-log events: every recompute rebuilds a
//! period from scratch and swaps it in, so running it twice never double counts.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate};
use serde::Serialize;
use tracing::info;

use crate::error::{CollectError, CollectResult};
use crate::model::{AvgStats, DigestStats, LogSlowQueryEvent, SumStats};
use crate::normalize::QueryType;
use crate::store::SlowQueryStore;

/// A calendar month (`YYYY-MM`) or day (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub label: String,
    pub start: NaiveDate,
    /// Exclusive.
    pub end: NaiveDate,
}

impl Period {
    pub fn parse(label: &str) -> CollectResult<Self> {
        let label = label.trim();
        if let Ok(day) = NaiveDate::parse_from_str(label, "%Y-%m-%d") {
            let end = day
                .succ_opt()
                .ok_or_else(|| CollectError::validation(format!("period out of range: {label}")))?;
            return Ok(Self {
                label: day.format("%Y-%m-%d").to_string(),
                start: day,
                end,
            });
        }

        let first = NaiveDate::parse_from_str(&format!("{label}-01"), "%Y-%m-%d").map_err(|_| {
            CollectError::validation(format!(
                "invalid period `{label}`; expected YYYY-MM or YYYY-MM-DD"
            ))
        })?;
        Self::month_of(first)
    }

    pub fn month_of(date: NaiveDate) -> CollectResult<Self> {
        let start = date.with_day(1).unwrap_or(date);
        let end = start
            .checked_add_months(Months::new(1))
            .ok_or_else(|| CollectError::validation(format!("period out of range: {date}")))?;
        Ok(Self {
            label: start.format("%Y-%m").to_string(),
            start,
            end,
        })
    }

    pub fn previous_month(&self) -> CollectResult<Self> {
        let start = self
            .start
            .with_day(1)
            .and_then(|d| d.checked_sub_months(Months::new(1)))
            .ok_or_else(|| CollectError::validation(format!("no month before {}", self.label)))?;
        Self::month_of(start)
    }
}

/// Per-instance roll-up of one period's digest stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub unique_digests: usize,
    pub execution_count: u64,
    pub total_time: f64,
    pub avg_time: f64,
    pub total_rows_examined: u64,
    pub read_count: usize,
    pub write_count: usize,
    pub ddl_count: usize,
    pub transaction_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationReport {
    pub period: String,
    pub stats: Vec<DigestStats>,
    pub instances: Vec<InstanceSummary>,
}

#[derive(Default)]
struct Accumulator {
    digest_query: String,
    query_type: Option<QueryType>,
    sums: SumStats,
}

/// Group events by (instance, digest) and fold them into stats for `period`. Sorted by
/// average time, slowest first.
pub fn compute(period: &Period, events: &[LogSlowQueryEvent]) -> Vec<DigestStats> {
    let mut groups: BTreeMap<(&str, &str), Accumulator> = BTreeMap::new();

    for event in events
        .iter()
        .filter(|e| e.event_date >= period.start && e.event_date < period.end)
    {
        let acc = groups
            .entry((event.instance_id.as_str(), event.digest.as_str()))
            .or_default();
        if acc.digest_query.is_empty() {
            acc.digest_query = event.normalized_sql.clone();
        }
        acc.query_type.get_or_insert(event.query_type);
        acc.sums.execution_count += 1;
        acc.sums.total_time += event.query_time;
        acc.sums.total_lock_time += event.lock_time;
        acc.sums.total_rows_examined += event.rows_examined;
        acc.sums.total_rows_sent += event.rows_sent;
    }

    let mut stats: Vec<DigestStats> = groups
        .into_iter()
        .map(|((instance_id, digest), acc)| {
            let n = acc.sums.execution_count.max(1) as f64;
            DigestStats {
                instance_id: instance_id.to_string(),
                digest: digest.to_string(),
                digest_query: acc.digest_query,
                query_type: acc.query_type.unwrap_or(QueryType::Other),
                period: period.label.clone(),
                avg_stats: AvgStats {
                    avg_lock_time: acc.sums.total_lock_time / n,
                    avg_rows_examined: acc.sums.total_rows_examined as f64 / n,
                    avg_rows_sent: acc.sums.total_rows_sent as f64 / n,
                    avg_time: acc.sums.total_time / n,
                },
                sum_stats: acc.sums,
            }
        })
        .collect();

    stats.sort_by(|a, b| b.avg_stats.avg_time.total_cmp(&a.avg_stats.avg_time));
    stats
}

pub fn summarize(stats: &[DigestStats]) -> Vec<InstanceSummary> {
    let mut by_instance: BTreeMap<&str, (InstanceSummary, HashSet<&str>)> = BTreeMap::new();

    for stat in stats {
        let (summary, digests) = by_instance
            .entry(stat.instance_id.as_str())
            .or_insert_with(|| {
                (
                    InstanceSummary {
                        instance_id: stat.instance_id.clone(),
                        ..InstanceSummary::default()
                    },
                    HashSet::new(),
                )
            });
        digests.insert(stat.digest.as_str());
        summary.execution_count += stat.sum_stats.execution_count;
        summary.total_time += stat.sum_stats.total_time;
        summary.total_rows_examined += stat.sum_stats.total_rows_examined;
        match stat.query_type {
            QueryType::Read => summary.read_count += 1,
            QueryType::Write => summary.write_count += 1,
            QueryType::Ddl => summary.ddl_count += 1,
            QueryType::Transaction => summary.transaction_count += 1,
            QueryType::Other => {}
        }
    }

    by_instance
        .into_values()
        .map(|(mut summary, digests)| {
            summary.unique_digests = digests.len();
            if summary.execution_count > 0 {
                summary.avg_time = summary.total_time / summary.execution_count as f64;
            }
            summary
        })
        .collect()
}

/// Reads events from the store and writes back whole periods.
#[derive(Clone)]
pub struct Aggregator {
    store: Arc<dyn SlowQueryStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn SlowQueryStore>) -> Self {
        Self { store }
    }

    /// Rebuild one period and replace whatever was stored for it.
    pub async fn recompute(&self, period: &str) -> CollectResult<AggregationReport> {
        let period = Period::parse(period)?;
        let events = self
            .store
            .log_events_between(period.start, period.end)
            .await?;
        let stats = compute(&period, &events);
        self.store
            .replace_digest_stats(period.label.clone(), stats.clone())
            .await?;

        info!(
            period = %period.label,
            events = events.len(),
            digests = stats.len(),
            "digest stats recomputed"
        );
        Ok(AggregationReport {
            instances: summarize(&stats),
            period: period.label,
            stats,
        })
    }

    /// Stored stats for a period; empty when nothing was collected.
    pub async fn stats(&self, period: &str) -> CollectResult<AggregationReport> {
        let period = Period::parse(period)?;
        let stats = self.store.digest_stats(period.label.clone()).await?;
        Ok(AggregationReport {
            instances: summarize(&stats),
            period: period.label,
            stats,
        })
    }
}
