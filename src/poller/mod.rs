use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::app::AppContext;
use crate::metrics::AppMetrics;
use crate::model::Instance;
use crate::state::SharedState;

mod aggregation;
pub mod live;

pub use live::{LiveDiff, LivePoller, LiveSet, TickSummary};

pub const LIVE_LOOP_PREFIX: &str = "live:";
pub const AGGREGATION_LOOP: &str = "aggregation";

type LoopFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type LoopFn = fn(AppContext) -> LoopFuture;

pub fn live_loop_name(instance_id: &str) -> String {
    format!("{LIVE_LOOP_PREFIX}{instance_id}")
}

/// Spawn one live poller per monitored instance plus the aggregation loop.
pub async fn spawn_all(ctx: AppContext) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for instance in ctx.registry.monitored().await {
        handles.push(spawn_live_loop(ctx.clone(), instance).await);
    }

    handles.push(spawn_loop(
        ctx.clone(),
        AGGREGATION_LOOP,
        ctx.config.aggregation.interval,
        Duration::from_secs(60),
        poll_aggregation,
    ));
    handles
}

/// Each instance owns its poller and live set; instances share nothing mutable, so a
/// failing server only delays its own loop.
async fn spawn_live_loop(ctx: AppContext, instance: Instance) -> JoinHandle<()> {
    let loop_name = live_loop_name(&instance.id);
    let interval = ctx.config.poller.interval;
    let budget = ctx.config.poller.remote_timeout;
    ctx.state.register_loop(&loop_name).await;

    let mut poller = LivePoller::new(
        instance,
        ctx.target.clone(),
        ctx.store.clone(),
        ctx.explain.clone(),
        ctx.metrics.clone(),
        ctx.config.poller.clone(),
    );

    tokio::spawn(async move {
        info!(loop_name = %loop_name, interval = ?interval, "starting live poller");

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let _ = observe(&ctx.metrics, &ctx.state, &loop_name, budget, poller.tick()).await;
        }
    })
}

fn spawn_loop(
    ctx: AppContext,
    loop_name: &'static str,
    interval: Duration,
    budget: Duration,
    poll_fn: LoopFn,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            loop_name,
            interval = ?interval,
            budget = ?budget,
            "starting poller loop"
        );

        // The first tick completes immediately, so every loop runs once at start-up.
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let _ = observe(&ctx.metrics, &ctx.state, loop_name, budget, poll_fn(ctx.clone())).await;
        }
    })
}

/// Run one iteration, recording its duration and outcome.
async fn observe<T, F>(
    metrics: &AppMetrics,
    state: &SharedState,
    loop_name: &str,
    budget: Duration,
    iteration: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    match iteration.await {
        Ok(value) => {
            let elapsed = start.elapsed();
            metrics.observe_duration(loop_name, elapsed);
            if elapsed > budget {
                warn!(
                    loop_name,
                    elapsed = ?elapsed,
                    budget = ?budget,
                    "loop exceeded budget"
                );
            }
            metrics.record_success(loop_name, true);
            state.record_loop_success(loop_name).await;
            Ok(value)
        }
        Err(err) => {
            error!(loop_name, error = ?err, "poller loop iteration failed");
            metrics.record_success(loop_name, false);
            metrics.inc_error(loop_name);
            state.record_loop_failure(loop_name, err.to_string()).await;
            Err(err)
        }
    }
}

fn poll_aggregation(ctx: AppContext) -> LoopFuture {
    Box::pin(async move { aggregation::run(&ctx).await })
}
