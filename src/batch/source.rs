use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::parser;
use crate::error::{CollectError, CollectResult};

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = CollectResult<T>> + Send + 'a>>;

/// One raw slow-log entry as delivered by the log API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogEvent {
    pub timestamp_ms: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPage {
    pub events: Vec<RawLogEvent>,
    /// Continuation token. `None`, or the token that was sent, means there is no more data.
    pub next_token: Option<String>,
}

/// Window request for one instance. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub instance_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub token: Option<String>,
    pub limit: usize,
}

/// Paginated access to exported slow-query logs.
pub trait LogSource: Send + Sync {
    fn fetch_page<'a>(&'a self, query: &'a LogQuery) -> SourceFuture<'a, LogPage>;
}

/// Reads `<root>/<instance_id>/*.log` files written in MySQL slow-log format.
#[derive(Debug, Clone)]
pub struct FileLogSource {
    root: PathBuf,
}

impl FileLogSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_instance(&self, instance_id: &str) -> CollectResult<Vec<RawLogEvent>> {
        let dir = self.root.join(instance_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(instance = instance_id, dir = %dir.display(), "no slow-log directory");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(CollectError::connectivity(format!(
                    "reading {}: {err}",
                    dir.display()
                )));
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| CollectError::connectivity(err.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "log") {
                files.push(path);
            }
        }
        files.sort();

        let mut events = Vec::new();
        for path in files {
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| CollectError::connectivity(format!("{}: {err}", path.display())))?;
            for message in parser::split_entries(&text) {
                let secs = parser::entry_timestamp(&message).unwrap_or(0);
                let Some(timestamp_ms) = secs.checked_mul(1000) else {
                    warn!(
                        instance = instance_id,
                        file = %path.display(),
                        timestamp = secs,
                        "skipping slow-log entry with out-of-range timestamp"
                    );
                    continue;
                };
                events.push(RawLogEvent {
                    timestamp_ms,
                    message,
                });
            }
        }
        events.sort_by_key(|e| e.timestamp_ms);
        Ok(events)
    }
}

impl LogSource for FileLogSource {
    fn fetch_page<'a>(&'a self, query: &'a LogQuery) -> SourceFuture<'a, LogPage> {
        Box::pin(async move {
            let offset = match query.token.as_deref() {
                None => 0,
                Some(token) => token
                    .parse::<usize>()
                    .map_err(|_| CollectError::validation(format!("bad page token `{token}`")))?,
            };
            let start = query.start.timestamp_millis();
            let end = query.end.timestamp_millis();

            let in_window: Vec<RawLogEvent> = self
                .read_instance(&query.instance_id)
                .await?
                .into_iter()
                .filter(|e| e.timestamp_ms >= start && e.timestamp_ms < end)
                .collect();

            let limit = query.limit.max(1);
            let events: Vec<RawLogEvent> =
                in_window.iter().skip(offset).take(limit).cloned().collect();
            let consumed = offset + events.len();
            let next_token = if consumed < in_window.len() {
                Some(consumed.to_string())
            } else {
                query.token.clone()
            };
            Ok(LogPage { events, next_token })
        })
    }
}
