use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::CollectResult;
use crate::model::Instance;
use crate::store::SlowQueryStore;

/// Counts produced by one [`InstanceRegistry::sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub ignored: usize,
}

/// Metadata for every monitored instance, shared by both collectors.
#[derive(Clone)]
pub struct InstanceRegistry {
    environment: Option<String>,
    instances: Arc<RwLock<BTreeMap<String, Instance>>>,
    store: Arc<dyn SlowQueryStore>,
}

impl InstanceRegistry {
    pub fn new(environment: Option<String>, store: Arc<dyn SlowQueryStore>) -> Self {
        Self {
            environment,
            instances: Arc::new(RwLock::new(BTreeMap::new())),
            store,
        }
    }

    fn in_environment(&self, instance: &Instance) -> bool {
        self.environment
            .as_deref()
            .is_none_or(|env| instance.tags.environment.eq_ignore_ascii_case(env))
    }

    /// Replace the registry contents. Instances missing from `instances` are removed, and
    /// instances outside the configured environment are ignored.
    pub async fn sync(&self, instances: Vec<Instance>) -> CollectResult<SyncSummary> {
        let mut summary = SyncSummary::default();
        let mut next = BTreeMap::new();
        for instance in instances {
            if self.in_environment(&instance) {
                next.insert(instance.id.clone(), instance);
            } else {
                debug!(instance = %instance.id, environment = %instance.tags.environment, "ignoring instance outside environment");
                summary.ignored += 1;
            }
        }

        let mut guard = self.instances.write().await;
        for (id, instance) in &next {
            match guard.get(id) {
                None => summary.added += 1,
                Some(existing) if existing != instance => summary.updated += 1,
                Some(_) => {}
            }
        }
        summary.removed = guard.keys().filter(|id| !next.contains_key(*id)).count();

        self.store
            .replace_instances(next.values().cloned().collect())
            .await?;
        *guard = next;

        info!(
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            ignored = summary.ignored,
            "instance registry synced"
        );
        Ok(summary)
    }

    /// Re-read the registry from the instances collection, e.g. after a snapshot restore.
    pub async fn reload(&self) -> CollectResult<SyncSummary> {
        let stored = self.store.list_instances().await?;
        self.sync(stored).await
    }

    pub async fn all(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Instances carrying the monitoring-enabled tag.
    pub async fn monitored(&self) -> Vec<Instance> {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.is_monitored())
            .cloned()
            .collect()
    }

    pub async fn find(&self, id: &str) -> Option<Instance> {
        self.instances.read().await.get(id).cloned()
    }

    /// Targets for a batch run: monitored instances, optionally narrowed to `filter`.
    pub async fn resolve(&self, filter: Option<&[String]>) -> Vec<Instance> {
        let monitored = self.monitored().await;
        match filter {
            Some(ids) if !ids.is_empty() => monitored
                .into_iter()
                .filter(|i| ids.iter().any(|id| id == &i.id))
                .collect(),
            _ => monitored,
        }
    }
}
