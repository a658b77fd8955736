use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::aggregate::AggregationReport;
use crate::app::AppContext;
use crate::batch::BatchRequest;
use crate::error::CollectError;
use crate::explain::ExplainOutcome;
use crate::jobs::{CollectionJob, JobError};
use crate::model::ProcessKey;
use crate::poller::LIVE_LOOP_PREFIX;
use crate::state::LoopHealth;

pub fn create_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/log-batch", post(submit_log_batch))
        .route("/jobs/explain-batch", post(submit_explain_batch))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/explain", post(explain_process))
        .route("/digest-stats/:period", get(get_digest_stats))
        .route("/digest-stats/:period/recompute", post(recompute_digest_stats))
        .route("/loops", get(get_loops));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Error body returned by every API route.
#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<CollectError> for ApiError {
    fn from(err: CollectError) -> Self {
        let status = match &err {
            CollectError::Validation(_) => StatusCode::BAD_REQUEST,
            CollectError::NotFound(_) => StatusCode::NOT_FOUND,
            CollectError::Fatal(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CollectError::Connectivity(_)
            | CollectError::Throttling(_)
            | CollectError::Timeout(_) => StatusCode::BAD_GATEWAY,
            CollectError::Data(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match &err {
            JobError::UnknownJob(_) => StatusCode::NOT_FOUND,
            JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
        };
        Self {
            status,
            body: ErrorBody {
                kind: "job".to_string(),
                message: err.to_string(),
            },
        }
    }
}

async fn get_healthz(State(ctx): State<AppContext>) -> StatusCode {
    let staleness = (ctx.config.poller.interval * 10).max(Duration::from_secs(60));
    if ctx.state.is_ready(LIVE_LOOP_PREFIX, staleness).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn get_loops(State(ctx): State<AppContext>) -> Json<Vec<LoopHealth>> {
    Json(ctx.state.loop_health().await)
}

#[derive(Debug, Serialize)]
struct SubmittedJob {
    job_id: String,
}

async fn submit_log_batch(
    State(ctx): State<AppContext>,
    Json(request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<SubmittedJob>), ApiError> {
    let job_id = ctx.batch.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmittedJob { job_id })))
}

#[derive(Debug, Deserialize)]
struct ExplainBody {
    instance_id: String,
    pid: u64,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct ExplainBatchBody {
    targets: Vec<ExplainTarget>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct ExplainTarget {
    instance_id: String,
    pid: u64,
}

async fn explain_process(
    State(ctx): State<AppContext>,
    Json(body): Json<ExplainBody>,
) -> Result<Json<ExplainOutcome>, ApiError> {
    let key = ProcessKey::new(body.instance_id, body.pid);
    let outcome = ctx.explain.explain_process(key, body.force).await?;
    Ok(Json(outcome))
}

async fn submit_explain_batch(
    State(ctx): State<AppContext>,
    Json(body): Json<ExplainBatchBody>,
) -> Result<(StatusCode, Json<SubmittedJob>), ApiError> {
    if body.targets.is_empty() {
        return Err(CollectError::validation("targets must not be empty").into());
    }
    let mut requests = Vec::with_capacity(body.targets.len());
    for target in body.targets {
        let key = ProcessKey::new(target.instance_id, target.pid);
        requests.push(ctx.explain.request_for(key, body.force).await?);
    }
    let job_id = ctx.explain.submit_batch(&ctx.jobs, requests).await;
    Ok((StatusCode::ACCEPTED, Json(SubmittedJob { job_id })))
}

async fn list_jobs(State(ctx): State<AppContext>) -> Json<Vec<CollectionJob>> {
    Json(ctx.jobs.list().await)
}

async fn get_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<CollectionJob>, ApiError> {
    ctx.jobs
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| JobError::UnknownJob(id).into())
}

async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<CollectionJob>, ApiError> {
    Ok(Json(ctx.jobs.cancel(&id).await?))
}

async fn get_digest_stats(
    State(ctx): State<AppContext>,
    Path(period): Path<String>,
) -> Result<Json<AggregationReport>, ApiError> {
    Ok(Json(ctx.aggregator.stats(&period).await?))
}

async fn recompute_digest_stats(
    State(ctx): State<AppContext>,
    Path(period): Path<String>,
) -> Result<Json<AggregationReport>, ApiError> {
    let report = ctx.aggregator.recompute(&period).await?;
    ctx.metrics.set_digest_stats(&report.period, report.stats.len());
    Ok(Json(report))
}
