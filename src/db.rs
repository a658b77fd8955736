use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Connection, Executor, Row};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{Credentials, PollerConfig};
use crate::error::{CollectError, CollectResult};
use crate::model::Instance;

pub type TargetFuture<'a, T> = Pin<Box<dyn Future<Output = CollectResult<T>> + Send + 'a>>;

/// One row of the server process list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub pid: u64,
    pub user: String,
    pub host: String,
    pub database: Option<String>,
    pub command: String,
    pub time_secs: u64,
    pub state: Option<String>,
    pub info: String,
}

/// Both renderings of one execution plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutput {
    pub json: serde_json::Value,
    pub tree: String,
}

/// Operations the collectors need from a monitored server.
pub trait TargetDatabase: Send + Sync {
    fn fetch_processlist<'a>(&'a self, instance: &'a Instance) -> TargetFuture<'a, Vec<ProcessRow>>;

    /// Whether `pid` is still executing a statement.
    fn is_running<'a>(&'a self, instance: &'a Instance, pid: u64) -> TargetFuture<'a, bool>;

    fn explain<'a>(
        &'a self,
        instance: &'a Instance,
        database: Option<&'a str>,
        sql: &'a str,
    ) -> TargetFuture<'a, PlanOutput>;
}

/// Keep rows at or above the threshold, outside excluded databases and users.
pub fn filter_slow(rows: Vec<ProcessRow>, config: &PollerConfig) -> Vec<ProcessRow> {
    let threshold = config.exec_time_threshold.as_secs();
    rows.into_iter()
        .filter(|row| row.time_secs >= threshold)
        .filter(|row| !row.info.trim().is_empty())
        .filter(|row| {
            row.database.as_deref().is_none_or(|db| {
                !config
                    .excluded_dbs
                    .iter()
                    .any(|excluded| excluded.eq_ignore_ascii_case(db))
            })
        })
        .filter(|row| {
            !config
                .excluded_users
                .iter()
                .any(|excluded| excluded.eq_ignore_ascii_case(&row.user))
        })
        .collect()
}

const PROCESSLIST_SQL: &str = "SELECT CAST(ID AS UNSIGNED) AS id, USER AS user, HOST AS host, DB AS db, \
     COMMAND AS command, CAST(TIME AS SIGNED) AS time, STATE AS state, INFO AS info \
     FROM information_schema.PROCESSLIST \
     WHERE INFO IS NOT NULL AND COMMAND <> 'Sleep' AND ID <> CONNECTION_ID()";

const LIVENESS_SQL: &str = "SELECT COUNT(*) FROM information_schema.PROCESSLIST \
     WHERE ID = ? AND INFO IS NOT NULL";

fn decode_process_row(row: &MySqlRow) -> Result<ProcessRow, sqlx::Error> {
    let time: i64 = row.try_get("time")?;
    Ok(ProcessRow {
        pid: row.try_get("id")?,
        user: row.try_get::<Option<String>, _>("user")?.unwrap_or_default(),
        host: row.try_get::<Option<String>, _>("host")?.unwrap_or_default(),
        database: row.try_get("db")?,
        command: row.try_get::<Option<String>, _>("command")?.unwrap_or_default(),
        time_secs: time.max(0) as u64,
        state: row.try_get("state")?,
        info: row.try_get::<Option<String>, _>("info")?.unwrap_or_default(),
    })
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Lazily created connection pools, one per instance, shared by every collector.
#[derive(Clone)]
pub struct MySqlTargets {
    credentials: Credentials,
    acquire_timeout: Duration,
    pools: Arc<RwLock<HashMap<String, MySqlPool>>>,
}

impl MySqlTargets {
    pub fn new(credentials: Credentials, acquire_timeout: Duration) -> Self {
        Self {
            credentials,
            acquire_timeout,
            pools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn pool(&self, instance: &Instance) -> MySqlPool {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&instance.id) {
                return pool.clone();
            }
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&instance.id) {
            return pool.clone();
        }

        let options = MySqlConnectOptions::new()
            .host(&instance.host)
            .port(instance.port)
            .username(&self.credentials.user)
            .password(&self.credentials.password);

        // Connectivity is validated by the first real query.
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .min_connections(0)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy_with(options);

        info!(
            instance = %instance.id,
            host = %instance.host,
            port = instance.port,
            "created MySQL pool"
        );
        pools.insert(instance.id.clone(), pool.clone());
        pool
    }

    /// Drop pools for instances that left the registry.
    pub async fn retain(&self, instance_ids: &[String]) {
        let mut pools = self.pools.write().await;
        pools.retain(|id, _| instance_ids.contains(id));
    }
}

impl TargetDatabase for MySqlTargets {
    fn fetch_processlist<'a>(&'a self, instance: &'a Instance) -> TargetFuture<'a, Vec<ProcessRow>> {
        Box::pin(async move {
            let pool = self.pool(instance).await;
            let rows = sqlx::query(PROCESSLIST_SQL).fetch_all(&pool).await?;
            rows.iter()
                .map(|row| decode_process_row(row).map_err(CollectError::from))
                .collect()
        })
    }

    fn is_running<'a>(&'a self, instance: &'a Instance, pid: u64) -> TargetFuture<'a, bool> {
        Box::pin(async move {
            let pool = self.pool(instance).await;
            let (count,): (i64,) = sqlx::query_as(LIVENESS_SQL)
                .bind(pid)
                .fetch_one(&pool)
                .await?;
            Ok(count > 0)
        })
    }

    fn explain<'a>(
        &'a self,
        instance: &'a Instance,
        database: Option<&'a str>,
        sql: &'a str,
    ) -> TargetFuture<'a, PlanOutput> {
        Box::pin(async move {
            let pool = self.pool(instance).await;
            let conn = pool.acquire().await?;
            let statements = ExplainStatements::new(database, sql);

            if !statements.binds_session() {
                let mut conn = conn;
                return run_explain(&mut conn, &statements).await;
            }

            // A connection switched with USE never goes back to the pool, on any exit path.
            let mut conn = conn.detach();
            let result = run_explain(&mut conn, &statements).await;
            let _ = conn.close().await;
            result
        })
    }
}

/// Statements issued for one plan capture, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExplainStatements {
    use_db: Option<String>,
    json: String,
    tree: String,
}

impl ExplainStatements {
    fn new(database: Option<&str>, sql: &str) -> Self {
        Self {
            use_db: database.map(|db| format!("USE {}", quote_identifier(db))),
            json: format!("EXPLAIN FORMAT=JSON {sql}"),
            tree: format!("EXPLAIN FORMAT=TREE {sql}"),
        }
    }

    /// Whether the session default schema is changed.
    fn binds_session(&self) -> bool {
        self.use_db.is_some()
    }
}

// Captured statements are arbitrary text, so they go over the text protocol.
async fn run_explain(
    conn: &mut MySqlConnection,
    statements: &ExplainStatements,
) -> CollectResult<PlanOutput> {
    if let Some(use_db) = &statements.use_db {
        (&mut *conn).execute(sqlx::raw_sql(use_db)).await?;
    }

    let row = (&mut *conn).fetch_one(sqlx::raw_sql(&statements.json)).await?;
    let raw_json: String = row.try_get(0)?;
    let json = serde_json::from_str(&raw_json)
        .map_err(|err| CollectError::data(format!("unreadable JSON plan: {err}")))?;

    let row = (&mut *conn).fetch_one(sqlx::raw_sql(&statements.tree)).await?;
    let tree: String = row.try_get(0)?;

    Ok(PlanOutput { json, tree })
}
