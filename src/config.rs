use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::model::Instance;

const DEFAULT_CONFIG_PATH: &str = "/config/slowmon.yaml";

/// Top-level configuration for the slowmon agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub explain: ExplainConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub credentials: Credentials,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Live process-list sampling.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "PollerConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Queries running at least this long are captured.
    #[serde(
        default = "PollerConfig::default_exec_time_threshold",
        with = "humantime_serde"
    )]
    pub exec_time_threshold: Duration,
    #[serde(default = "PollerConfig::default_excluded_dbs")]
    pub excluded_dbs: Vec<String>,
    #[serde(default = "PollerConfig::default_excluded_users")]
    pub excluded_users: Vec<String>,
    /// Upper bound for a single process-list fetch.
    #[serde(
        default = "PollerConfig::default_remote_timeout",
        with = "humantime_serde"
    )]
    pub remote_timeout: Duration,
}

impl PollerConfig {
    const fn default_interval() -> Duration {
        Duration::from_secs(1)
    }

    const fn default_exec_time_threshold() -> Duration {
        Duration::from_secs(2)
    }

    fn default_excluded_dbs() -> Vec<String> {
        strings(&["information_schema", "mysql", "performance_schema"])
    }

    fn default_excluded_users() -> Vec<String> {
        strings(&["monitor", "rdsadmin", "system user", "mysql_mgmt"])
    }

    const fn default_remote_timeout() -> Duration {
        Duration::from_secs(3)
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
            exec_time_threshold: Self::default_exec_time_threshold(),
            excluded_dbs: Self::default_excluded_dbs(),
            excluded_users: Self::default_excluded_users(),
            remote_timeout: Self::default_remote_timeout(),
        }
    }
}

/// Explain-plan capture. `max_concurrency` is a hard ceiling on in-flight fetches.
#[derive(Debug, Clone, Deserialize)]
pub struct ExplainConfig {
    #[serde(default = "ExplainConfig::default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "ExplainConfig::default_deadline", with = "humantime_serde")]
    pub deadline: Duration,
    #[serde(default = "ExplainConfig::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl ExplainConfig {
    const fn default_max_concurrency() -> usize {
        4
    }

    const fn default_deadline() -> Duration {
        Duration::from_secs(10)
    }

    const fn default_queue_capacity() -> usize {
        1024
    }
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            max_concurrency: Self::default_max_concurrency(),
            deadline: Self::default_deadline(),
            queue_capacity: Self::default_queue_capacity(),
        }
    }
}

/// Retrospective slow-log collection.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "BatchConfig::default_workers")]
    pub workers: usize,
    #[serde(default = "BatchConfig::default_page_size")]
    pub page_size: usize,
    #[serde(default = "BatchConfig::default_max_range_days")]
    pub max_range_days: i64,
    #[serde(default = "BatchConfig::default_excluded_users")]
    pub excluded_users: Vec<String>,
    #[serde(default = "BatchConfig::default_page_timeout", with = "humantime_serde")]
    pub page_timeout: Duration,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "BatchConfig::default_log_dir")]
    pub log_dir: PathBuf,
}

impl BatchConfig {
    const fn default_workers() -> usize {
        5
    }

    const fn default_page_size() -> usize {
        10_000
    }

    const fn default_max_range_days() -> i64 {
        31
    }

    fn default_excluded_users() -> Vec<String> {
        strings(&["rdsadmin", "event_scheduler"])
    }

    const fn default_page_timeout() -> Duration {
        Duration::from_secs(30)
    }

    fn default_log_dir() -> PathBuf {
        PathBuf::from("/var/lib/slowmon/slowlogs")
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            page_size: Self::default_page_size(),
            max_range_days: Self::default_max_range_days(),
            excluded_users: Self::default_excluded_users(),
            page_timeout: Self::default_page_timeout(),
            retry: RetryConfig::default(),
            log_dir: Self::default_log_dir(),
        }
    }
}

/// Exponential backoff applied per log page.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "RetryConfig::default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl RetryConfig {
    const fn default_max_attempts() -> u32 {
        5
    }

    const fn default_base_delay() -> Duration {
        Duration::from_millis(200)
    }

    const fn default_max_delay() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay: Self::default_base_delay(),
            max_delay: Self::default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "AggregationConfig::default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl AggregationConfig {
    const fn default_interval() -> Duration {
        Duration::from_secs(15 * 60)
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: Self::default_interval(),
        }
    }
}

/// Instances handed over at start-up, plus the environment they must belong to.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "RegistryConfig::default_environment")]
    pub environment: Option<String>,
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl RegistryConfig {
    fn default_environment() -> Option<String> {
        Some("prd".to_string())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            environment: Self::default_environment(),
            instances: Vec::new(),
        }
    }
}

/// HTTP listener configuration (bind address).
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_bind")]
    pub bind: String,
}

impl HttpConfig {
    fn default_bind() -> String {
        "0.0.0.0:8282".to_string()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
        }
    }
}

/// Monitoring account used against every target instance. Populated from the
/// environment only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Load configuration from YAML disk file, falling back to defaults + env overrides.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let target_path = if let Some(path) = path {
        path.to_path_buf()
    } else if let Ok(env_path) = env::var("SLOWMON_CONFIG") {
        PathBuf::from(env_path)
    } else {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    };

    let mut config = match try_parse_file(&target_path)? {
        Some(cfg) => {
            info!(path = %target_path.display(), "loaded configuration");
            cfg
        }
        None => {
            warn!(path = %target_path.display(), "config file not found; using built-in defaults");
            AppConfig::default()
        }
    };

    enforce_yaml_policy(&config)?;
    apply_env_overrides(&mut config)?;
    validate(&config)?;
    ensure_required_secrets(&config)?;
    Ok(config)
}

fn try_parse_file(path: &Path) -> Result<Option<AppConfig>> {
    match fs::read_to_string(path) {
        Ok(raw) => {
            let cfg = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse YAML config at {}", path.display()))?;
            Ok(Some(cfg))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file at {}", path.display()))
        }
    }
}

fn enforce_yaml_policy(config: &AppConfig) -> Result<()> {
    if !config.credentials.password.is_empty() {
        bail!(
            "Remove `credentials.password` from slowmon YAML config; set SLOWMON_MYSQL_PASSWORD in the environment instead."
        );
    }
    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    if let Ok(environment) = env::var("SLOWMON_ENVIRONMENT") {
        config.registry.environment = if environment.is_empty() {
            None
        } else {
            Some(environment)
        };
    }

    if let Ok(user) = env::var("SLOWMON_MYSQL_USER") {
        if !user.is_empty() {
            config.credentials.user = user;
        }
    }

    match env::var("SLOWMON_MYSQL_PASSWORD") {
        Ok(password) => {
            if password.is_empty() {
                bail!(
                    "Environment variable SLOWMON_MYSQL_PASSWORD is set but empty; populate it in your .env file."
                );
            }
            config.credentials.password = password;
        }
        Err(env::VarError::NotPresent) => {}
        Err(err) => return Err(err.into()),
    };

    Ok(())
}

/// Reject limits that would disable backpressure.
pub fn validate(config: &AppConfig) -> Result<()> {
    if config.explain.max_concurrency == 0 {
        bail!("explain.max_concurrency must be at least 1");
    }
    if config.batch.workers == 0 {
        bail!("batch.workers must be at least 1");
    }
    if config.batch.page_size == 0 {
        bail!("batch.page_size must be at least 1");
    }
    if config.batch.retry.max_attempts == 0 {
        bail!("batch.retry.max_attempts must be at least 1");
    }
    if config.poller.interval.is_zero() {
        bail!("poller.interval must be greater than zero");
    }
    if config.aggregation.interval.is_zero() {
        bail!("aggregation.interval must be greater than zero");
    }
    Ok(())
}

fn ensure_required_secrets(config: &AppConfig) -> Result<()> {
    if config.credentials.user.trim().is_empty() || config.credentials.password.is_empty() {
        bail!(
            "Missing MySQL monitoring credentials. Set SLOWMON_MYSQL_USER and SLOWMON_MYSQL_PASSWORD (see .env.sample)."
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_with_humantime_durations() {
        let raw = r#"
poller:
  interval: 500ms
  exec_time_threshold: 5s
explain:
  max_concurrency: 2
batch:
  workers: 3
  retry:
    max_attempts: 2
    base_delay: 10ms
registry:
  environment: stg
  instances:
    - id: orders-1
      host: orders-1.internal
      region: ap-northeast-2
      tags:
        monitoring_enabled: true
        environment: stg
        team: payments
"#;
        let cfg: AppConfig = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(cfg.poller.interval, Duration::from_millis(500));
        assert_eq!(cfg.poller.exec_time_threshold, Duration::from_secs(5));
        assert_eq!(cfg.poller.excluded_dbs.len(), 3);
        assert_eq!(cfg.explain.max_concurrency, 2);
        assert_eq!(cfg.batch.workers, 3);
        assert_eq!(cfg.batch.retry.max_attempts, 2);
        assert_eq!(cfg.batch.retry.max_delay, Duration::from_secs(10));
        assert_eq!(cfg.registry.environment.as_deref(), Some("stg"));

        let instance = &cfg.registry.instances[0];
        assert_eq!(instance.port, 3306);
        assert!(instance.tags.monitoring_enabled);
        assert_eq!(instance.tags.extra.get("team").map(String::as_str), Some("payments"));
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.explain.max_concurrency = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn zero_loop_intervals_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.poller.interval = Duration::ZERO;
        assert!(validate(&cfg).is_err());

        let mut cfg = AppConfig::default();
        cfg.aggregation.interval = Duration::ZERO;
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("aggregation.interval"));

        let cfg: AppConfig = serde_yaml::from_str("aggregation:\n  interval: 0s\n").expect("parse");
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn password_in_yaml_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.credentials.password = "hunter2".into();
        assert!(enforce_yaml_policy(&cfg).is_err());
    }
}
