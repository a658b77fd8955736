//! MySQL slow-query log entries.
//!
//! An entry looks like:
//!
//! ```text
//! # Time: 2024-05-01T10:00:03.000181Z
//! # User@Host: app[app] @  [10.0.0.5]  Id: 12345
//! # Query_time: 3.000181  Lock_time: 0.000012 Rows_sent: 1  Rows_examined: 48213
//! use shop;
//! SET timestamp=1714557600;
//! SELECT * FROM orders WHERE customer_id = 42;
//! ```

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::{CollectError, CollectResult};
use crate::model::LogSlowQueryEvent;
use crate::normalize;

static USER_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^# User@Host:\s*(?P<user>[^\[\s]*)\s*\[[^\]]*\]\s*@\s*(?P<host>[^\[]*?)\s*(?:\[(?P<ip>[^\]]*)\])?(?:\s+Id:\s*\d+)?\s*$")
        .expect("user@host pattern")
});

static STATS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^# Query_time:\s*(?P<query_time>\d+(?:\.\d+)?)\s+Lock_time:\s*(?P<lock_time>\d+(?:\.\d+)?)\s+Rows_sent:\s*(?P<rows_sent>\d+)\s+Rows_examined:\s*(?P<rows_examined>\d+)")
        .expect("query stats pattern")
});

static SET_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^SET timestamp=(?P<ts>\d+);$").expect("timestamp pattern"));

static USE_DB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^use\s+`?(?P<db>[^`;\s]+)`?;$").expect("use pattern"));

/// Fields of one parsed slow-log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowLogEntry {
    pub user: String,
    pub host: String,
    pub query_time: f64,
    pub lock_time: f64,
    pub rows_sent: u64,
    pub rows_examined: u64,
    pub timestamp: Option<i64>,
    pub database: Option<String>,
    pub sql: String,
}

impl SlowLogEntry {
    /// Normalize the statement and attach it to `instance_id`. Events without a
    /// `SET timestamp` fall back to the time the log API reported.
    pub fn into_event(self, instance_id: &str, fallback_ms: i64) -> CollectResult<LogSlowQueryEvent> {
        let secs = self.timestamp.unwrap_or(fallback_ms.div_euclid(1000));
        let timestamp = DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| CollectError::data(format!("timestamp out of range: {secs}")))?;
        let normalized = normalize::normalize(&self.sql);

        Ok(LogSlowQueryEvent {
            instance_id: instance_id.to_string(),
            event_date: timestamp.date_naive(),
            timestamp,
            digest: normalized.digest,
            normalized_sql: normalized.text,
            raw_sql: self.sql,
            query_type: normalized.query_type,
            user: self.user,
            host: self.host,
            database: self.database,
            lock_time: self.lock_time,
            rows_examined: self.rows_examined,
            rows_sent: self.rows_sent,
            query_time: self.query_time,
        })
    }
}

fn is_server_banner(line: &str) -> bool {
    line.starts_with("Tcp port:")
        || line.starts_with("Time                 Id Command")
        || line.contains(", Version: ")
}

/// Split a slow-log file into entries. Text before the first entry header (the server
/// banner) is dropped.
pub fn split_entries(text: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut current: Option<String> = None;
    let mut has_user = false;

    for line in text.lines() {
        let starts_entry = line.starts_with("# Time:")
            || (line.starts_with("# User@Host:") && (current.is_none() || has_user));
        if starts_entry {
            if let Some(done) = current.take() {
                entries.push(done);
            }
            current = Some(String::new());
            has_user = false;
        }
        if line.starts_with("# User@Host:") {
            has_user = true;
        }
        if is_server_banner(line) {
            continue;
        }
        if let Some(entry) = current.as_mut() {
            entry.push_str(line);
            entry.push('\n');
        }
    }
    if let Some(done) = current {
        entries.push(done);
    }
    entries
}

/// Value of the `SET timestamp=` line, if any.
pub fn entry_timestamp(message: &str) -> Option<i64> {
    message
        .lines()
        .find_map(|line| SET_TIMESTAMP.captures(line.trim()))
        .and_then(|caps| caps["ts"].parse().ok())
}

fn parse_num<T: std::str::FromStr>(raw: &str, field: &str) -> CollectResult<T> {
    raw.parse()
        .map_err(|_| CollectError::data(format!("invalid {field}: {raw}")))
}

pub fn parse_entry(message: &str) -> CollectResult<SlowLogEntry> {
    let mut user_host = None;
    let mut stats = None;
    let mut timestamp = None;
    let mut database = None;
    let mut sql_lines = Vec::new();

    for line in message.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(caps) = USER_HOST.captures(trimmed) {
            let host = caps.name("host").map(|m| m.as_str().trim()).unwrap_or("");
            let ip = caps.name("ip").map(|m| m.as_str().trim()).unwrap_or("");
            user_host = Some((
                caps["user"].to_string(),
                if host.is_empty() { ip } else { host }.to_string(),
            ));
        } else if let Some(caps) = STATS.captures(trimmed) {
            stats = Some((
                parse_num::<f64>(&caps["query_time"], "Query_time")?,
                parse_num::<f64>(&caps["lock_time"], "Lock_time")?,
                parse_num::<u64>(&caps["rows_sent"], "Rows_sent")?,
                parse_num::<u64>(&caps["rows_examined"], "Rows_examined")?,
            ));
        } else if trimmed.starts_with('#') {
            continue;
        } else if let Some(caps) = SET_TIMESTAMP.captures(trimmed) {
            timestamp = Some(parse_num::<i64>(&caps["ts"], "timestamp")?);
        } else if sql_lines.is_empty() && USE_DB.is_match(trimmed) {
            database = USE_DB
                .captures(trimmed)
                .map(|caps| caps["db"].to_string());
        } else {
            sql_lines.push(trimmed);
        }
    }

    let (user, host) =
        user_host.ok_or_else(|| CollectError::data("missing # User@Host header"))?;
    let (query_time, lock_time, rows_sent, rows_examined) =
        stats.ok_or_else(|| CollectError::data("missing # Query_time header"))?;
    let sql = sql_lines.join(" ");
    let sql = sql.trim().trim_end_matches(';').trim_end().to_string();
    if sql.is_empty() {
        return Err(CollectError::data("entry has no statement"));
    }

    Ok(SlowLogEntry {
        user,
        host,
        query_time,
        lock_time,
        rows_sent,
        rows_examined,
        timestamp,
        database,
        sql,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::QueryType;

    const LOG: &str = "/rdsdbbin/mysql/bin/mysqld, Version: 8.0.32 (Source distribution). started with:
Tcp port: 3306  Unix socket: /tmp/mysql.sock
Time                 Id Command    Argument
# Time: 2024-05-01T10:00:03.000181Z
# User@Host: app[app] @  [10.0.0.5]  Id: 12345
# Query_time: 3.000181  Lock_time: 0.000012 Rows_sent: 1  Rows_examined: 48213
use shop;
SET timestamp=1714557600;
SELECT *
  FROM orders WHERE customer_id = 42;
# User@Host: batch[batch] @ worker-1 [10.0.0.9]  Id: 9
# Query_time: 12.5  Lock_time: 0.1 Rows_sent: 0  Rows_examined: 900000
SET timestamp=1714557700;
UPDATE orders SET state = 'closed' WHERE created_at < '2024-01-01';
";

    #[test]
    fn splits_on_time_and_bare_user_headers() {
        let entries = split_entries(LOG);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("# Time:"));
        assert!(entries[1].starts_with("# User@Host: batch"));
        assert!(!entries[0].contains("Tcp port"));
    }

    #[test]
    fn parses_fields_and_database() {
        let entries = split_entries(LOG);
        let first = parse_entry(&entries[0]).expect("first entry");
        assert_eq!(first.user, "app");
        assert_eq!(first.host, "10.0.0.5");
        assert_eq!(first.rows_examined, 48213);
        assert_eq!(first.timestamp, Some(1714557600));
        assert_eq!(first.database.as_deref(), Some("shop"));
        assert_eq!(first.sql, "SELECT * FROM orders WHERE customer_id = 42");

        let second = parse_entry(&entries[1]).expect("second entry");
        assert_eq!(second.host, "worker-1");
        assert_eq!(second.query_time, 12.5);

        let event = second.into_event("orders-1", 0).expect("event");
        assert_eq!(event.query_type, QueryType::Write);
        assert_eq!(
            event.normalized_sql,
            "UPDATE orders SET state = ? WHERE created_at < ?"
        );
        assert_eq!(event.event_date.to_string(), "2024-05-01");
    }

    #[test]
    fn entries_without_headers_are_data_errors() {
        let err = parse_entry("SELECT 1;").unwrap_err();
        assert_eq!(err.kind(), "data");
        assert_eq!(entry_timestamp("SET timestamp=17;\nSELECT 1;"), Some(17));
    }
}
