use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize)]
pub struct LoopHealth {
    pub name: String,
    #[serde(with = "chrono::serde::ts_seconds_option")]
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl LoopHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            last_success_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Default)]
struct SharedStateInner {
    loop_health: RwLock<BTreeMap<String, LoopHealth>>,
}

/// Loop bookkeeping shared by the pollers and the HTTP layer.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<SharedStateInner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a loop count towards readiness before its first iteration finishes.
    pub async fn register_loop(&self, loop_name: &str) {
        let mut guard = self.inner.loop_health.write().await;
        guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
    }

    pub async fn record_loop_success(&self, loop_name: &str) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.last_success_at = Some(Utc::now());
        entry.consecutive_failures = 0;
        entry.last_error = None;
    }

    pub async fn record_loop_failure(&self, loop_name: &str, error: String) {
        let mut guard = self.inner.loop_health.write().await;
        let entry = guard
            .entry(loop_name.to_string())
            .or_insert_with(|| LoopHealth::new(loop_name));
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error);
    }

    pub async fn loop_health(&self) -> Vec<LoopHealth> {
        self.inner
            .loop_health
            .read()
            .await
            .values()
            .cloned()
            .collect()
    }

    /// Every loop whose name starts with `prefix` has succeeded within `max_staleness`.
    pub async fn is_ready(&self, prefix: &str, max_staleness: Duration) -> bool {
        let health = self.inner.loop_health.read().await;
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(max_staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        health
            .values()
            .filter(|entry| entry.name.starts_with(prefix))
            .all(|entry| {
                entry.consecutive_failures == 0
                    && entry
                        .last_success_at
                        .is_some_and(|last| now.signed_duration_since(last) <= staleness)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn readiness_follows_loop_outcomes() {
        let state = SharedState::new();
        state.register_loop("live:a").await;
        state.register_loop("live:b").await;
        assert!(!state.is_ready("live:", Duration::from_secs(60)).await);

        state.record_loop_success("live:a").await;
        state.record_loop_success("live:b").await;
        assert!(state.is_ready("live:", Duration::from_secs(60)).await);

        state.record_loop_failure("live:b", "connection refused".into()).await;
        assert!(!state.is_ready("live:", Duration::from_secs(60)).await);

        let health = state.loop_health().await;
        assert_eq!(health[1].consecutive_failures, 1);
        assert_eq!(health[1].last_error.as_deref(), Some("connection refused"));
    }
}
