use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use sluice_core::error::SluiceError;
use sluice_core::types::{PipelineStats, Record, RunFailure, RunId, RunRecord, RunStatus};
use sluice_engine::{ApprovalOutcome, CancelOutcome};

use crate::middleware::Authenticated;
use crate::state::AppState;

/// Engine error mapped onto an HTTP status.
pub struct ApiError(SluiceError);

impl From<SluiceError> for ApiError {
    fn from(e: SluiceError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SluiceError::RunNotFound(_)
            | SluiceError::PipelineNotFound(_)
            | SluiceError::StepNotFound(_)
            | SluiceError::GateNotFound { .. } => StatusCode::NOT_FOUND,
            SluiceError::InvalidRunState { .. } => StatusCode::CONFLICT,
            SluiceError::InvalidPipeline(_) | SluiceError::CycleDetected { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Run as returned by the API, without its definition and seed.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunView {
    pub id: RunId,
    pub pipeline_code: String,
    pub status: RunStatus,
    pub stats: PipelineStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<RunRecord> for RunView {
    fn from(run: RunRecord) -> Self {
        Self {
            id: run.id,
            pipeline_code: run.pipeline_code,
            status: run.status,
            stats: run.stats,
            error: run.error,
            started_at: run.started_at,
            updated_at: run.updated_at,
            finished_at: run.finished_at,
        }
    }
}

// GET /api/health (no auth required)
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
pub struct StartRunBody {
    pub pipeline: String,
    #[serde(default)]
    pub seed: Vec<Record>,
    /// Drive the run before responding instead of in the background.
    #[serde(default)]
    pub wait: bool,
}

// POST /api/runs
pub async fn start_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRunBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.wait {
        let run = state.engine.start_run(&body.pipeline, body.seed).await?;
        return Ok((StatusCode::OK, Json(json!(RunView::from(run)))));
    }
    let run_id = state.engine.spawn_run(&body.pipeline, body.seed).await?;
    info!(run_id = %run_id, pipeline = %body.pipeline, "Run started via API");
    Ok((StatusCode::ACCEPTED, Json(json!({ "runId": run_id }))))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<RunStatus>,
}

// GET /api/runs?status=PAUSED
pub async fn list_runs(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let runs: Vec<RunView> = state
        .engine
        .list_runs(q.status)
        .await?
        .into_iter()
        .map(RunView::from)
        .collect();
    Ok(Json(json!({ "runs": runs })))
}

// GET /api/runs/{id}
pub async fn get_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_string(&id);
    let run = state.engine.run(&run_id).await?;
    let checkpoint = state.engine.checkpoint(&run_id).await?;
    let gates: Vec<Value> = checkpoint
        .engine
        .awaiting_gates()
        .filter_map(|key| {
            let gate = checkpoint.engine.gates.get(key)?;
            Some(json!({
                "stepKey": key,
                "approvalType": gate.approval_type,
                "pendingRecords": gate.pending_record_count,
                "pausedAt": gate.paused_at,
                "expiresAt": checkpoint.engine.gate_timeouts.get(key).map(|t| t.expires_at),
            }))
        })
        .collect();
    Ok(Json(json!({
        "run": RunView::from(run),
        "awaitingGates": gates,
    })))
}

// GET /api/runs/{id}/dead-letters
pub async fn dead_letters(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_string(&id);
    // 404 for unknown runs rather than an empty list
    state.engine.run(&run_id).await?;
    let letters = state.engine.dead_letters(&run_id).await?;
    Ok(Json(json!({ "deadLetters": letters })))
}

// POST /api/runs/{id}/gates/{step}/approve
pub async fn approve_gate(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, step)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_string(&id);
    let body = match state.engine.approve_gate(&run_id, &step).await? {
        ApprovalOutcome::Resumed(run) => json!({
            "outcome": "resumed",
            "run": RunView::from(run),
        }),
        ApprovalOutcome::AlreadyApproved => json!({ "outcome": "alreadyApproved" }),
    };
    Ok(Json(body))
}

// POST /api/runs/{id}/resume
pub async fn resume_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run = state.engine.resume(&RunId::from_string(&id)).await?;
    Ok(Json(json!(RunView::from(run))))
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = match state.engine.cancel(&RunId::from_string(&id)).await? {
        CancelOutcome::Requested => "requested",
        CancelOutcome::Cancelled => "cancelled",
    };
    Ok(Json(json!({ "outcome": outcome })))
}

// GET /api/pipelines
pub async fn list_pipelines(_auth: Authenticated, State(state): State<Arc<AppState>>) -> Json<Value> {
    let pipelines: Vec<Value> = state
        .engine
        .pipelines()
        .iter()
        .map(|p| json!({ "code": p.code, "name": p.name, "steps": p.steps.len() }))
        .collect();
    Json(json!({ "pipelines": pipelines }))
}
