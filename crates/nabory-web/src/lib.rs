//! JSON trigger and query endpoints for the funding-call pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nabory_storage::{CatalogStore, OpportunityQuery};
use nabory_sync::{
    deduplicate, BatchOrchestrator, BatchSummary, PipelineError, ScanGuard, ScanTrigger,
    SourceRunReport, TriggerOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "nabory-web";

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BatchOrchestrator>,
    pub trigger: ScanTrigger,
}

impl AppState {
    pub fn new(orchestrator: Arc<BatchOrchestrator>, guard: ScanGuard) -> Self {
        let trigger = ScanTrigger::new(orchestrator.clone(), guard);
        Self {
            orchestrator,
            trigger,
        }
    }

    fn store(&self) -> &Arc<dyn CatalogStore> {
        self.orchestrator.store()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/scrape", post(scrape_source_handler))
        .route("/api/scrape/partition", get(partition_handler))
        .route("/api/cron/batch/{batch}", get(batch_handler))
        .route("/api/cron/trigger", get(trigger_handler).post(trigger_handler))
        .route("/api/cron/status", get(status_handler))
        .route("/api/deduplicate", post(deduplicate_handler))
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/logs", get(logs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeRequest {
    source_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ScrapeResponse {
    success: bool,
    #[serde(flatten)]
    report: SourceRunReport,
}

async fn scrape_source_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScrapeRequest>,
) -> Response {
    let Some(raw_id) = req.source_id.filter(|s| !s.trim().is_empty()) else {
        return error_json(StatusCode::BAD_REQUEST, "sourceId is required");
    };
    let Ok(id) = Uuid::parse_str(raw_id.trim()) else {
        return error_json(StatusCode::NOT_FOUND, "source not found");
    };

    match state.orchestrator.run_single_source(id).await {
        Ok(report) => Json(ScrapeResponse {
            success: true,
            report,
        })
        .into_response(),
        Err(PipelineError::SourceNotFound(_)) => {
            error_json(StatusCode::NOT_FOUND, "source not found")
        }
        Err(PipelineError::SourceInactive(_)) => {
            error_json(StatusCode::BAD_REQUEST, "source is inactive")
        }
        Err(PipelineError::Fetch(err)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string(), "itemsFound": 0 })),
        )
            .into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct PartitionParams {
    start: Option<usize>,
    count: Option<usize>,
}

async fn partition_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PartitionParams>,
) -> Response {
    let start = params.start.unwrap_or(0);
    let count = params
        .count
        .unwrap_or_else(|| state.orchestrator.batch_size());
    summary_response(state.orchestrator.run_partition(start, count).await)
}

async fn batch_handler(State(state): State<Arc<AppState>>, Path(batch): Path<u32>) -> Response {
    summary_response(state.orchestrator.run_batch_number(batch).await)
}

fn summary_response(result: Result<BatchSummary, PipelineError>) -> Response {
    match result {
        Ok(summary) => Json(summary).into_response(),
        Err(err @ PipelineError::InvalidBatchNumber(_)) => {
            error_json(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Err(err) => server_error(err),
    }
}

async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.trigger.trigger() {
        outcome @ TriggerOutcome::Started { .. } => (
            StatusCode::ACCEPTED,
            Json(json!({ "message": "full scan started", "status": outcome })),
        )
            .into_response(),
        outcome @ TriggerOutcome::AlreadyRunning { .. } => Json(json!({
            "message": "full scan already in progress; trigger skipped",
            "status": outcome,
        }))
        .into_response(),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.trigger.guard().status()).into_response()
}

async fn deduplicate_handler(State(state): State<Arc<AppState>>) -> Response {
    match deduplicate(state.store().as_ref()).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    total: u64,
    limit: usize,
    offset: usize,
    has_more: bool,
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunityQuery>,
) -> Response {
    match state.store().search_opportunities(&query).await {
        Ok(page) => {
            let pagination = Pagination {
                total: page.total,
                limit: query.limit(),
                offset: query.offset(),
                has_more: ((query.offset() + page.data.len()) as u64) < page.total,
            };
            Json(json!({ "data": page.data, "pagination": pagination })).into_response()
        }
        Err(err) => server_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct LogParams {
    limit: Option<usize>,
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    match state.store().recent_logs(limit).await {
        Ok(logs) => Json(logs).into_response(),
        Err(err) => server_error(err),
    }
}

fn error_json(status: StatusCode, message: &str) -> Response {
    warn!(%status, message, "request rejected");
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}
