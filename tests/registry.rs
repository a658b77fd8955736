mod common;

use std::sync::Arc;

use common::instance;
use slowmon::model::Instance;
use slowmon::registry::InstanceRegistry;
use slowmon::store::{MemoryStore, SlowQueryStore};

fn tagged(id: &str, environment: &str, monitored: bool) -> Instance {
    let mut instance = instance(id);
    instance.tags.environment = environment.to_string();
    instance.tags.monitoring_enabled = monitored;
    instance
}

#[tokio::test]
async fn sync_filters_by_environment_and_persists() {
    let store = Arc::new(MemoryStore::new());
    let registry = InstanceRegistry::new(Some("prd".to_string()), store.clone());

    let summary = registry
        .sync(vec![
            tagged("orders-1", "prd", true),
            tagged("orders-2", "PRD", false),
            tagged("staging-1", "stg", true),
        ])
        .await
        .unwrap();
    assert_eq!(summary.added, 2);
    assert_eq!(summary.ignored, 1);

    let ids: Vec<String> = registry.all().await.into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["orders-1", "orders-2"]);
    let monitored: Vec<String> = registry.monitored().await.into_iter().map(|i| i.id).collect();
    assert_eq!(monitored, vec!["orders-1"]);
    assert_eq!(store.list_instances().await.unwrap().len(), 2);
}

#[tokio::test]
async fn resync_reports_updates_and_removals() {
    let store = Arc::new(MemoryStore::new());
    let registry = InstanceRegistry::new(None, store.clone());
    registry
        .sync(vec![tagged("a", "prd", true), tagged("b", "dev", true)])
        .await
        .unwrap();

    let mut moved = tagged("a", "prd", true);
    moved.host = "a-new.cluster.internal".to_string();
    let summary = registry
        .sync(vec![moved, tagged("c", "prd", true)])
        .await
        .unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.removed, 1);
    assert!(registry.find("b").await.is_none());
    assert_eq!(
        registry.find("a").await.unwrap().host,
        "a-new.cluster.internal"
    );

    let reloaded = InstanceRegistry::new(None, store.clone());
    reloaded.reload().await.unwrap();
    assert_eq!(reloaded.all().await.len(), 2);
}

#[tokio::test]
async fn resolve_narrows_to_requested_monitored_instances() {
    let store = Arc::new(MemoryStore::new());
    let registry = InstanceRegistry::new(Some("prd".to_string()), store);
    registry
        .sync(vec![
            tagged("a", "prd", true),
            tagged("b", "prd", true),
            tagged("c", "prd", false),
        ])
        .await
        .unwrap();

    assert_eq!(registry.resolve(None).await.len(), 2);
    let picked = registry
        .resolve(Some(&["b".to_string(), "c".to_string(), "zzz".to_string()]))
        .await;
    assert_eq!(picked.into_iter().map(|i| i.id).collect::<Vec<_>>(), vec!["b"]);
}
