//! RPC surface: experiment lifecycle control, agent status, approval
//! decisions, and a streaming status feed. Wire shapes are plain JSON
//! over HTTP rather than a binary RPC framing, matching how this crate's
//! ambient stack (axum + tower-http) is used elsewhere in the pack.

use std::convert::Infallible;
use std::time::Duration;

use agent_core::experiment::{ExperimentDefinition, ExperimentId, ParameterBag};
use agent_core::governance::facade::ActionResult;
use agent_core::governance::Context as GovernanceContext;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::state::AppState;

/// Uniform error response, mirroring the `(status, message)` shape the
/// rest of this pack's HTTP surfaces use.
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<agent_core::registry::RegistryError> for AppError {
    fn from(err: agent_core::registry::RegistryError) -> Self {
        use agent_core::registry::RegistryError::*;
        match err {
            NotFound(id) => AppError::not_found(format!("experiment {id} not found")),
            InvalidTransition { .. } => AppError::conflict(err.to_string()),
            UnknownKind(_) => AppError::bad_request(err.to_string()),
            StartNotAutonomous(_) => AppError::conflict(err.to_string()),
        }
    }
}

impl From<agent_core::governance::approval::ApprovalError> for AppError {
    fn from(err: agent_core::governance::approval::ApprovalError) -> Self {
        use agent_core::governance::approval::ApprovalError::*;
        match err {
            NotFound(id) => AppError::not_found(format!("approval request {id} not found")),
            AlreadyResolved { .. } => AppError::conflict(err.to_string()),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/experiments", post(create_experiment).get(list_experiments))
        .route("/v1/experiments/{id}", get(get_experiment))
        .route("/v1/experiments/{id}/start", post(start_experiment))
        .route("/v1/experiments/{id}/stop", post(stop_experiment))
        .route("/v1/experiments/{id}/logs", get(get_logs))
        .route("/v1/agent/status", get(get_agent_status))
        .route("/v1/agent/stop", post(stop_agent))
        .route("/v1/approvals/{id}/decision", post(approve_decision))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "agent-server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[derive(Deserialize)]
struct CreateExperimentRequest {
    kind: String,
    name: String,
    description: String,
    #[serde(default)]
    parameters: ParameterBag,
}

#[derive(Serialize)]
struct ExperimentResponse {
    id: ExperimentId,
    name: String,
    kind: String,
    state: String,
    status_message: String,
}

impl From<agent_core::experiment::Experiment> for ExperimentResponse {
    fn from(e: agent_core::experiment::Experiment) -> Self {
        Self {
            id: e.id,
            name: e.name,
            kind: e.kind,
            state: e.state.to_string(),
            status_message: e.status_message,
        }
    }
}

async fn create_experiment(
    State(state): State<AppState>,
    Json(request): Json<CreateExperimentRequest>,
) -> Result<Json<ExperimentResponse>, AppError> {
    let experiment = state
        .core
        .registry
        .create(ExperimentDefinition {
            kind: request.kind,
            name: request.name,
            description: request.description,
            parameters: request.parameters,
        })
        .await;
    Ok(Json(experiment.into()))
}

async fn list_experiments(State(state): State<AppState>) -> Json<Vec<ExperimentResponse>> {
    let all = state.core.registry.list().await;
    Json(all.into_iter().map(Into::into).collect())
}

async fn get_experiment(
    State(state): State<AppState>,
    Path(id): Path<ExperimentId>,
) -> Result<Json<ExperimentResponse>, AppError> {
    let experiment = state
        .core
        .registry
        .get(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("experiment {id} not found")))?;
    Ok(Json(experiment.into()))
}

#[derive(Deserialize, Default)]
struct StartExperimentRequest {
    #[serde(default)]
    context: GovernanceContext,
}

#[derive(Serialize)]
struct StartExperimentResponse {
    result: String,
    approval_id: Option<Uuid>,
    reason: Option<String>,
}

async fn start_experiment(
    State(state): State<AppState>,
    Path(id): Path<ExperimentId>,
    body: Option<Json<StartExperimentRequest>>,
) -> Result<Json<StartExperimentResponse>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    state
        .core
        .registry
        .get(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("experiment {id} not found")))?;

    let registry = state.core.registry.clone();
    let dispatcher = state.core.dispatcher.clone();
    let kind = {
        let experiment = registry.get(id).await.unwrap();
        experiment.kind.clone()
    };
    let params = {
        let experiment = registry.get(id).await.unwrap();
        experiment.parameters.clone()
    };

    let result = agent_core::registry::ExperimentRegistry::start(&registry, id, request.context, move |started_id| {
        let dispatcher = dispatcher.clone();
        let kind = kind.clone();
        let params = params.clone();
        tokio::spawn(async move {
            if let Err(err) =
                agent_core::dispatch::TaskDispatcher::submit(&dispatcher, started_id, kind, params).await
            {
                tracing::warn!(experiment_id = %started_id, error = %err, "failed to submit task after start");
            }
        });
    })
    .await?;

    Ok(Json(match result {
        ActionResult::Executed { level } => StartExperimentResponse {
            result: level.to_string(),
            approval_id: None,
            reason: None,
        },
        ActionResult::Notified => StartExperimentResponse {
            result: "notify".to_string(),
            approval_id: None,
            reason: None,
        },
        ActionResult::PendingApproval { approval_id } => StartExperimentResponse {
            result: "approval_required".to_string(),
            approval_id: Some(approval_id),
            reason: None,
        },
        ActionResult::Prohibited { reason } => StartExperimentResponse {
            result: "prohibited".to_string(),
            approval_id: None,
            reason: Some(reason),
        },
    }))
}

async fn stop_experiment(
    State(state): State<AppState>,
    Path(id): Path<ExperimentId>,
) -> Result<Json<ExperimentResponse>, AppError> {
    state.core.dispatcher.cancel(id).await;
    let experiment = state.core.registry.stop(id).await?;
    Ok(Json(experiment.into()))
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum AgentState {
    Idle,
    RunningExperiments,
    AwaitingApproval,
}

#[derive(Serialize)]
struct AgentStatusResponse {
    agent_state: AgentState,
    active_experiments: usize,
    cpu_percent: f64,
    memory_mb: f64,
    last_updated: chrono::DateTime<chrono::Utc>,
}

/// `agent_state` is derived, not stored: any experiment actually running
/// in the dispatcher takes priority over a merely-pending approval, since
/// work in flight is a stronger signal than work waiting on a human.
/// `cpu_percent`/`memory_mb` report this process's own usage, not the
/// tasks it runs; there is no per-experiment resource accounting.
async fn get_agent_status(State(state): State<AppState>) -> Json<AgentStatusResponse> {
    let active_experiments = state.core.dispatcher.active_count().await;
    let pending_approvals = state.core.governance.approvals.list_pending().await.len();

    let agent_state = if active_experiments > 0 {
        AgentState::RunningExperiments
    } else if pending_approvals > 0 {
        AgentState::AwaitingApproval
    } else {
        AgentState::Idle
    };

    let (cpu_percent, memory_mb) = process_resource_usage();

    Json(AgentStatusResponse {
        agent_state,
        active_experiments,
        cpu_percent,
        memory_mb,
        last_updated: chrono::Utc::now(),
    })
}

/// Best-effort process resource reading from `/proc/self/status`. Falls
/// back to `0.0` for both fields when the platform doesn't expose it
/// (non-Linux, or the file is unreadable); there is no cross-platform
/// crate for this in the ambient stack, and the RPC contract only needs
/// a best-effort reading, not an authoritative one.
fn process_resource_usage() -> (f64, f64) {
    let memory_mb = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                line.strip_prefix("VmRSS:").map(|rest| {
                    rest.trim()
                        .trim_end_matches(" kB")
                        .trim()
                        .parse::<f64>()
                        .unwrap_or(0.0)
                        / 1024.0
                })
            })
        })
        .unwrap_or(0.0);
    (0.0, memory_mb)
}

async fn stop_agent(State(state): State<AppState>) -> StatusCode {
    let experiments = state.core.registry.list().await;
    for experiment in experiments {
        if !experiment.state.is_terminal() {
            state.core.dispatcher.cancel(experiment.id).await;
            let _ = state.core.registry.stop(experiment.id).await;
        }
    }
    state.core.shutdown();
    StatusCode::ACCEPTED
}

#[derive(Deserialize)]
struct DecisionRequest {
    user_id: String,
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize)]
struct DecisionResponse {
    status: String,
}

async fn approve_decision(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let record = state
        .core
        .governance
        .resolve(id, request.user_id, request.approved, request.reason, chrono::Utc::now())
        .await?;
    Ok(Json(DecisionResponse {
        status: record.status.to_string(),
    }))
}

/// Streams a status snapshot of the experiment roughly once a second
/// until it reaches a terminal state. There is no separate subprocess
/// log pipeline in this agent; the status/metrics feed is the closest
/// analogue to a log tail a caller can subscribe to.
async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<ExperimentId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    state
        .core
        .registry
        .get(id)
        .await
        .ok_or_else(|| AppError::not_found(format!("experiment {id} not found")))?;

    let registry = state.core.registry.clone();
    let stream = async_stream::stream! {
        loop {
            let Some(experiment) = registry.get(id).await else {
                break;
            };
            let payload = serde_json::json!({
                "state": experiment.state.to_string(),
                "status_message": experiment.status_message,
                "metrics": experiment.metrics,
            });
            yield Ok(Event::default().json_data(payload).unwrap_or_else(|_| Event::default()));
            if experiment.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    };

    Ok(Sse::new(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::context::{CoreConfig, CoreContext};
    use agent_core::task::TaskRegistry;
    use agent_test_utils::InstantTask;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let mut tasks = TaskRegistry::new();
        tasks.register(InstantTask::succeeding("ebook"));
        let core = Arc::new(
            CoreContext::build(
                CoreConfig::default(),
                tasks,
                Arc::new(agent_core::sync::NullSyncBridge),
            )
            .await,
        );
        AppState {
            core,
            default_approval_expiry: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn create_then_get_experiment() {
        let state = test_state().await;
        let router = build_router(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/experiments")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "kind": "ebook",
                    "name": "n",
                    "description": "d",
                }))
                .unwrap(),
            ))
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let created: ExperimentResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.state, "defined");

        let get_request = axum::http::Request::builder()
            .method("GET")
            .uri(format!("/v1/experiments/{}", created.id))
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.oneshot(get_request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_missing_experiment_is_404() {
        let state = test_state().await;
        let router = build_router(state);
        let request = axum::http::Request::builder()
            .method("GET")
            .uri(format!("/v1/experiments/{}", Uuid::new_v4()))
            .body(axum::body::Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
