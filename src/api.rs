//! REST control surface for workflows and the supervisor.
//!
//! Lifecycle changes go through the `Supervisor`; handlers never write
//! `is_running` or `last_run_at` themselves.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::{DatabaseError, WorkflowError};
use crate::store::WorkflowStore;
use crate::supervisor::{Supervisor, SupervisorStatus};
use crate::workflow::model::{WorkflowDefinition, WorkflowExecutionResult, WorkflowSpec};

/// Shared state for API routes.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn WorkflowStore>,
    pub supervisor: Supervisor,
}

/// Error response: `{"error": "..."}` with a status derived from the
/// workflow error.
pub struct ApiError(WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        Self(e)
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Self(WorkflowError::Database(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WorkflowError::NotFound { .. } => StatusCode::NOT_FOUND,
            WorkflowError::Incomplete(_)
            | WorkflowError::IntervalTooShort { .. }
            | WorkflowError::IntervalTooLong { .. }
            | WorkflowError::TypeMismatch { .. }
            | WorkflowError::Config(_) => StatusCode::BAD_REQUEST,
            WorkflowError::SupervisorStopped => StatusCode::CONFLICT,
            WorkflowError::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            WorkflowError::Database(_) => {
                tracing::error!(error = %self.0, "API request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// GET /api/workflows
async fn list_workflows(State(state): State<ApiState>) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    Ok(Json(state.store.list_workflows().await?))
}

/// POST /api/workflows
///
/// Creates a stopped workflow.
async fn create_workflow(
    State(state): State<ApiState>,
    Json(spec): Json<WorkflowSpec>,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    let workflow = WorkflowDefinition::new(spec)?;
    state.store.create_workflow(&workflow).await?;
    tracing::info!(workflow_id = %workflow.id, name = %workflow.name, "Workflow created");
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn load(state: &ApiState, id: &str) -> ApiResult<WorkflowDefinition> {
    state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| WorkflowError::NotFound { id: id.to_string() }.into())
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    Ok(Json(load(&state, &id).await?))
}

/// PUT /api/workflows/{id}
///
/// Replaces the user-editable fields. A running workflow restarts with
/// the new definition.
async fn update_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(spec): Json<WorkflowSpec>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let mut workflow = load(&state, &id).await?;
    workflow.apply_update(spec)?;
    state.store.update_workflow(&workflow).await?;
    state.supervisor.reload_workflow(&id).await?;
    Ok(Json(load(&state, &id).await?))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.supervisor.delete_workflow(&id).await? {
        tracing::info!(workflow_id = %id, "Workflow deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(WorkflowError::NotFound { id }.into())
    }
}

/// POST /api/workflows/{id}/start
async fn start_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    Ok(Json(state.supervisor.start_workflow(&id).await?))
}

/// POST /api/workflows/{id}/stop
async fn stop_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    Ok(Json(state.supervisor.stop_workflow(&id).await?))
}

/// POST /api/workflows/{id}/run
///
/// One iteration now. Execution failures are reported in the body with
/// a 200; only lookup errors fail the request.
async fn run_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowExecutionResult>> {
    Ok(Json(state.supervisor.run_workflow(&id).await?))
}

/// GET /api/supervisor
async fn supervisor_status(State(state): State<ApiState>) -> Json<SupervisorStatus> {
    Json(state.supervisor.status().await)
}

/// POST /api/supervisor/start
async fn start_supervisor(State(state): State<ApiState>) -> ApiResult<Json<SupervisorStatus>> {
    state.supervisor.start().await?;
    Ok(Json(state.supervisor.status().await))
}

/// POST /api/supervisor/stop
async fn stop_supervisor(State(state): State<ApiState>) -> ApiResult<Json<SupervisorStatus>> {
    state.supervisor.stop().await?;
    Ok(Json(state.supervisor.status().await))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Build the control API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/start", post(start_workflow))
        .route("/api/workflows/{id}/stop", post(stop_workflow))
        .route("/api/workflows/{id}/run", post(run_workflow))
        .route("/api/supervisor", get(supervisor_status))
        .route("/api/supervisor/start", post(start_supervisor))
        .route("/api/supervisor/stop", post(stop_supervisor))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
