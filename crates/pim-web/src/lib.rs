//! Axum routes for pipeline triggers and status polling.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pim_storage::Store;
use pim_sync::{scheduled_jobs, Busy, PipelineWorker, ScheduleConfig, TaskKind};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const CRATE_NAME: &str = "pim-web";

#[derive(Clone)]
pub struct AppState {
    pub worker: PipelineWorker,
    pub store: Arc<dyn Store>,
    pub schedule: ScheduleConfig,
}

impl AppState {
    pub fn new(worker: PipelineWorker, store: Arc<dyn Store>, schedule: ScheduleConfig) -> Self {
        Self {
            worker,
            store,
            schedule,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    backfill_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AnalyzeQuery {
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineQuery {
    backfill_days: Option<u32>,
    batch_size: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/tasks/sync", post(sync_handler))
        .route("/tasks/analyze", post(analyze_handler))
        .route("/tasks/cluster", post(cluster_handler))
        .route("/tasks/trends", post(trends_handler))
        .route("/tasks/pipeline", post(pipeline_handler))
        .route("/worker/status", get(worker_status_handler))
        .route("/scheduler/status", get(scheduler_status_handler))
        .route("/sync/status", get(sync_status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving pipeline api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// 202 once the task is spawned, 409 while another task holds the worker.
fn accepted<T>(task: TaskKind, spawned: Result<JoinHandle<T>, Busy>) -> Response {
    match spawned {
        Ok(_detached) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task": task, "status": "accepted" })),
        )
            .into_response(),
        Err(busy) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": busy.to_string(), "running": busy.running })),
        )
            .into_response(),
    }
}

async fn sync_handler(State(state): State<Arc<AppState>>, Query(query): Query<SyncQuery>) -> Response {
    accepted(TaskKind::Sync, state.worker.trigger_sync(query.backfill_days))
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyzeQuery>,
) -> Response {
    accepted(TaskKind::Analysis, state.worker.trigger_analysis(query.batch_size))
}

async fn cluster_handler(State(state): State<Arc<AppState>>) -> Response {
    accepted(TaskKind::Clustering, state.worker.trigger_clustering())
}

async fn trends_handler(State(state): State<Arc<AppState>>) -> Response {
    accepted(TaskKind::Trends, state.worker.trigger_trends())
}

async fn pipeline_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PipelineQuery>,
) -> Response {
    accepted(
        TaskKind::Pipeline,
        state.worker.trigger_pipeline(query.backfill_days, query.batch_size),
    )
}

async fn worker_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.worker.status()).into_response()
}

async fn scheduler_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "enabled": state.schedule.enabled,
        "jobs": scheduled_jobs(&state.schedule),
    }))
    .into_response()
}

async fn sync_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.sync_status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => {
            error!(error = %err, "loading sync status failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
