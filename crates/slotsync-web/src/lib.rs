//! HTTP trigger surface for the sync engine.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use slotsync_core::dates::{parse_date, parse_work_days};
use slotsync_core::{SyncError, SyncRun, SyncTotals};
use slotsync_sync::{DateOutcome, SlotStore, SyncReport, SyncTrigger, WindowSyncRequest};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "slotsync-web";

#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<dyn SyncTrigger>,
    pub store: Arc<dyn SlotStore>,
}

impl AppState {
    pub fn new(trigger: Arc<dyn SyncTrigger>, store: Arc<dyn SlotStore>) -> Self {
        Self { trigger, store }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncBody {
    pub window_start: String,
    pub window_end: String,
    #[serde(default)]
    pub work_days: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub message: String,
    pub run_id: Uuid,
    pub totals: SyncTotals,
    pub dates: Vec<DateOutcome>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub category: &'static str,
}

enum ApiError {
    Sync(SyncError),
    NotFound(String),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        Self::Sync(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, category) = match self {
            ApiError::Sync(err) => (
                StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                err.to_string(),
                err.kind().as_str(),
            ),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message, "not_found"),
        };
        let body = ErrorResponse {
            success: false,
            message,
            category,
        };
        (status, Json(body)).into_response()
    }
}

fn sync_response(report: SyncReport) -> Json<SyncResponse> {
    let skipped = report.totals.skipped;
    let message = if skipped == 0 {
        format!("synced {} dates", report.dates.len())
    } else {
        format!("synced {} dates, {skipped} skipped", report.dates.len())
    };
    Json(SyncResponse {
        success: true,
        message,
        run_id: report.run_id,
        totals: report.totals,
        dates: report.dates,
    })
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/accounts/{account_id}/sync", post(window_sync_handler))
        .route("/accounts/{account_id}/sync/{date}", post(single_date_handler))
        .route("/accounts/{account_id}/runs", get(account_runs_handler))
        .route("/runs/{run_id}", get(run_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind_addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %listener.local_addr()?, "trigger surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": CRATE_NAME}))
}

async fn window_sync_handler(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    payload: Result<Json<SyncBody>, JsonRejection>,
) -> Result<Json<SyncResponse>, ApiError> {
    let Json(body) = payload.map_err(|e| SyncError::InvalidRequest(e.body_text()))?;
    let mut request = WindowSyncRequest::new(
        account_id,
        parse_date(&body.window_start)?,
        parse_date(&body.window_end)?,
    );
    if let Some(days) = &body.work_days {
        request = request.with_work_days(parse_work_days(days)?);
    }
    let report = state.trigger.run_window_sync(request).await.inspect_err(|err| {
        warn!(kind = err.kind().as_str(), error = %err, "triggered window sync failed");
    })?;
    Ok(sync_response(report))
}

async fn single_date_handler(
    State(state): State<Arc<AppState>>,
    Path((account_id, date)): Path<(String, String)>,
) -> Result<Json<SyncResponse>, ApiError> {
    let date = parse_date(&date)?;
    let report = state.trigger.sync_single_date(&account_id, date).await.inspect_err(|err| {
        warn!(kind = err.kind().as_str(), error = %err, "triggered single-date sync failed");
    })?;
    Ok(sync_response(report))
}

async fn account_runs_handler(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<SyncRun>>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let runs = state
        .store
        .recent_runs(Some(&account_id), limit)
        .await
        .map_err(SyncError::store)?;
    Ok(Json(runs))
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<SyncRun>, ApiError> {
    let run_id = Uuid::parse_str(&run_id).map_err(|e| SyncError::InvalidRequest(format!("bad run id: {e}")))?;
    match state.store.get_run(run_id).await.map_err(SyncError::store)? {
        Some(run) => Ok(Json(run)),
        None => Err(ApiError::NotFound(format!("run {run_id} not found"))),
    }
}
