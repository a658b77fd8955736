use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::store::{MemoryStore, StoreSnapshot};

pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub flush_interval: Duration,
}

impl PersistenceConfig {
    pub fn from_env() -> Option<Self> {
        let dir = std::env::var("SLOWMON_DATA_DIR").ok()?;
        let interval = std::env::var("SLOWMON_FLUSH_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        Some(Self {
            data_dir: PathBuf::from(dir),
            flush_interval: Duration::from_secs(interval),
        })
    }
}

/// Restore the store from disk. A missing or unreadable snapshot leaves it empty.
pub async fn load_if_exists(cfg: &PersistenceConfig, store: &MemoryStore) {
    let path = snapshot_path(&cfg.data_dir);
    match tokio::fs::read(&path).await {
        Ok(bytes) => match serde_json::from_slice::<StoreSnapshot>(&bytes) {
            Ok(snapshot) => {
                let live = snapshot.live_queries.len();
                let events = snapshot.log_events.len();
                store.restore(snapshot).await;
                info!(file = ?path, live, events, "loaded store snapshot");
            }
            Err(err) => {
                warn!(error = ?err, file = ?path, "failed to parse store snapshot");
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(file = ?path, "no store snapshot found (first run?)");
        }
        Err(err) => {
            warn!(error = ?err, file = ?path, "failed reading store snapshot");
        }
    }
}

pub fn spawn_flush_loop(cfg: PersistenceConfig, store: MemoryStore) -> tokio::task::JoinHandle<()> {
    info!(dir = ?cfg.data_dir, interval = ?cfg.flush_interval, "starting persistence flush loop");
    tokio::spawn(async move {
        loop {
            sleep(cfg.flush_interval).await;
            if let Err(err) = flush_once(&cfg, &store).await {
                error!(error = ?err, "flush failed");
            }
        }
    })
}

pub async fn flush_once(cfg: &PersistenceConfig, store: &MemoryStore) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&cfg.data_dir).await?;
    let path = snapshot_path(&cfg.data_dir);
    let snapshot = store.snapshot().await;
    let json = serde_json::to_vec(&snapshot)?;
    // Write to a temp file, then rename, so readers never see half a snapshot.
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    info!(file = ?path, size = json.len(), "flushed store snapshot");
    Ok(())
}

fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join("store.json")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::SlowQueryRecord;
    use crate::normalize::{self, QueryType};
    use crate::store::SlowQueryStore;

    #[tokio::test]
    async fn flush_and_load_round_trip() {
        let store = MemoryStore::new();
        let sql = "SELECT * FROM orders WHERE id = 7";
        let n = normalize::normalize(sql);
        store
            .upsert_live_query(SlowQueryRecord {
                pid: 612786858,
                instance_id: "orders-1".into(),
                database: Some("shop".into()),
                user: "app".into(),
                host: "10.0.0.5".into(),
                exec_time_secs: 4,
                sql_text: sql.into(),
                normalized_sql: n.text,
                digest: n.digest,
                query_type: QueryType::Read,
                start: Utc::now(),
                end: None,
            })
            .await
            .expect("upsert");

        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = PersistenceConfig {
            data_dir: dir.path().to_path_buf(),
            flush_interval: Duration::from_secs(1),
        };
        flush_once(&cfg, &store).await.expect("flush ok");

        let restored = MemoryStore::new();
        load_if_exists(&cfg, &restored).await;
        assert_eq!(restored.live_query_count().await, 1);
    }
}
