use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::Error as DotenvError;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use slowmon::app::AppContext;
use slowmon::batch::source::FileLogSource;
use slowmon::db::MySqlTargets;
use slowmon::jobs::JobTracker;
use slowmon::metrics::AppMetrics;
use slowmon::persistence::{PersistenceConfig, flush_once, load_if_exists, spawn_flush_loop};
use slowmon::store::MemoryStore;
use slowmon::{config, http, poller};

#[derive(Debug, Parser)]
#[command(author, version, about = "slowmon: MySQL/Aurora slow query monitor")]
struct Cli {
    /// Path to YAML configuration file. Defaults to env SLOWMON_CONFIG or built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    let bind_addr: SocketAddr = config
        .http
        .bind
        .parse()
        .context("invalid http.bind address")?;

    let metrics = AppMetrics::new()?;
    let store = MemoryStore::new();
    let persistence = PersistenceConfig::from_env();
    if let Some(cfg) = &persistence {
        load_if_exists(cfg, &store).await;
    } else {
        warn!("persistence disabled: SLOWMON_DATA_DIR not set");
    }

    let targets = MySqlTargets::new(config.credentials.clone(), config.poller.remote_timeout);
    let log_source = FileLogSource::new(config.batch.log_dir.clone());
    let seed = config.registry.instances.clone();

    let (ctx, explain_worker) = AppContext::new(
        config,
        Arc::new(store.clone()),
        Arc::new(targets.clone()),
        Arc::new(log_source),
        metrics,
    );

    // Configured instances win; a snapshot only fills in when the config lists none.
    let synced = if seed.is_empty() {
        ctx.registry.reload().await
    } else {
        ctx.registry.sync(seed).await
    };
    let summary = synced.context("failed to seed instance registry")?;
    info!(
        instances = summary.added + summary.updated,
        "instance registry ready"
    );
    let known: Vec<String> = ctx.registry.all().await.into_iter().map(|i| i.id).collect();
    targets.retain(&known).await;

    let mut handles = vec![
        tokio::spawn(explain_worker.run()),
        spawn_job_logger(ctx.jobs.clone(), ctx.metrics.clone()),
    ];
    if let Some(cfg) = persistence {
        if let Err(err) = flush_once(&cfg, &store).await {
            error!(error = ?err, dir = ?cfg.data_dir, "initial persistence flush failed");
        }
        handles.push(spawn_flush_loop(cfg, store.clone()));
    }
    handles.extend(poller::spawn_all(ctx.clone()).await);

    let router = http::create_router(ctx.clone());

    info!("slowmon listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("failed to bind HTTP listener")?;

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = ?err, "server terminated with error");
    }

    shutdown_tasks(handles).await;

    // Final flush so records written just before termination survive a restart.
    if let Some(cfg) = PersistenceConfig::from_env() {
        if let Err(err) = flush_once(&cfg, &store).await {
            warn!(error = ?err, "final persistence flush failed");
        } else {
            info!("final persistence flush complete");
        }
    }

    Ok(())
}

fn load_env() {
    if let Err(err) = dotenvy::dotenv() {
        match err {
            DotenvError::Io(io_err) if io_err.kind() == ErrorKind::NotFound => {}
            other => eprintln!("warning: failed to load .env file: {other}"),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("slowmon=info,axum::rejection=trace"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Audit trail for job transitions, independent of any attached status transport.
fn spawn_job_logger(jobs: JobTracker, metrics: AppMetrics) -> JoinHandle<()> {
    let mut events = jobs.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    info!(
                        job_id = %event.job_id,
                        kind = %event.kind,
                        status = %event.status,
                        succeeded = event.progress.succeeded,
                        failed = event.progress.failed,
                        percent = event.progress.percent,
                        "job event"
                    );
                    if event.status.is_terminal() {
                        metrics.inc_job_finished(event.kind.as_str(), event.status.as_str());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "job event logger lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
            sigterm.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

async fn shutdown_tasks(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}
