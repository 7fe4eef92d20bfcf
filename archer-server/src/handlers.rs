//! Coordinator endpoints. Every handler is a thin shell over [`ScanService`].
//!
//! [`ScanService`]: archer_core::ScanService

use archer_contracts::{CompletedTaskRequest, NewScanRequest, SuccessResponse, WORKER_ID_HEADER};
use archer_model::{Scan, ScanId, Task, TaskId, WorkerId};
use axum::{
    Json,
    extract::{FromRequestParts, Path, State, rejection::JsonRejection},
    http::request::Parts,
};
use tracing::debug;

use crate::errors::{ApiError, ApiResult};
use crate::state::AppState;

/// Identity of the worker reporting a task transition.
#[derive(Debug, Clone)]
pub struct WorkerIdentity(pub WorkerId);

impl<S: Send + Sync> FromRequestParts<S> for WorkerIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(WORKER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| WorkerIdentity(WorkerId::from_raw(value)))
            .ok_or_else(|| {
                ApiError::missing_param(
                    "X-Worker-Id",
                    "X-Worker-Id header is required",
                )
            })
    }
}

pub async fn health() -> Json<SuccessResponse> {
    Json(SuccessResponse::ok())
}

pub async fn create_scan(
    State(state): State<AppState>,
    body: Result<Json<NewScanRequest>, JsonRejection>,
) -> ApiResult<Json<Scan>> {
    let Json(request) = body?;
    let scan = state.service.create_scan(request).await?;
    Ok(Json(scan))
}

pub async fn list_scans(State(state): State<AppState>) -> ApiResult<Json<Vec<Scan>>> {
    Ok(Json(state.service.scans().await?))
}

pub async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Scan>> {
    Ok(Json(state.service.scan(&ScanId::from_raw(id)).await?))
}

pub async fn get_scan_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.service.scan_tasks(&ScanId::from_raw(id)).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.service.task(&TaskId::from_raw(id)).await?))
}

pub async fn task_started(
    State(state): State<AppState>,
    Path(id): Path<String>,
    WorkerIdentity(worker): WorkerIdentity,
) -> ApiResult<Json<SuccessResponse>> {
    debug!(task = %id, worker = %worker, "start reported");
    state
        .service
        .task_started(&TaskId::from_raw(id), &worker)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

pub async fn task_completed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    WorkerIdentity(worker): WorkerIdentity,
    body: Result<Json<CompletedTaskRequest>, JsonRejection>,
) -> ApiResult<Json<SuccessResponse>> {
    let Json(CompletedTaskRequest { results }) = body?;
    debug!(task = %id, worker = %worker, results, "completion reported");
    state
        .service
        .task_completed(&TaskId::from_raw(id), &worker, results)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

pub async fn task_failed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    WorkerIdentity(worker): WorkerIdentity,
) -> ApiResult<Json<SuccessResponse>> {
    debug!(task = %id, worker = %worker, "failure reported");
    state
        .service
        .task_failed(&TaskId::from_raw(id), &worker)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}
