//! HTTP control plane server for deployd.
//!
//! Exposes pipelines, installed app versions, deployment runs and their
//! timelines/stages, supersession, workflow status ingestion and resource
//! trees as a small JSON API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use deploy_core::{
    DeployTrigger, DeploymentAppType, DeploymentRun, Id, InstalledAppVersion,
    InstalledAppVersionHistory, Pipeline, ReleaseKind, RunStatus, TimelineEntry, TimelineOwner,
    WorkflowStage, WorkflowType,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::history::{ConfigHistoryService, DeployedConfiguration, DeploymentSnapshot, HistoryError};
use crate::orchestrator::{DeployOrchestrator, EnqueueResult};
use crate::resource_tree::{AppResourceTree, ReconcileError, ResourceTreeReconciler};
use crate::scheduler::TriggerQueue;
use crate::stages::{StageTracker, StageTrackerError, WorkflowStatusUpdate};
use crate::storage::{Storage, StorageError};
use crate::supersede::{ReleaseError, SupersessionError, SupersessionManager};
use crate::timeline::{TimelineError, TimelineRecorder};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub orchestrator: Arc<DeployOrchestrator>,
    pub queue: TriggerQueue,
    pub supersession: Arc<SupersessionManager>,
    pub stages: StageTracker,
    pub timelines: TimelineRecorder,
    pub reconciler: Arc<ResourceTreeReconciler>,
    pub history: ConfigHistoryService,
    pub reports_dir: PathBuf,
    pub auth_token: Option<String>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/pipelines", post(upsert_pipeline).get(list_pipelines))
        .route("/pipelines/{id}", get(get_pipeline))
        .route("/pipelines/{id}/supersede", post(supersede_pipeline))
        .route("/pipelines/{id}/resource-tree", get(resource_tree))
        .route("/pipelines/{id}/configuration", get(deployed_configuration))
        .route("/deployments", post(create_deployment))
        .route("/deployments/{id}", get(get_deployment))
        .route("/deployments/{id}/deploy", post(deploy))
        .route("/histories/{id}/timeline", get(history_timeline))
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/timeline", get(run_timeline))
        .route("/runs/{id}/stages", get(run_stages))
        .route("/runs/{id}/report", get(run_report))
        .route("/runs/{id}/status", post(update_run_status))
        .route("/runs/{id}/fail", post(fail_run))
        .route("/runs/{id}/workflow-status", post(workflow_status))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `cancel` fires.
pub async fn start_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(context: &str, e: &StorageError) -> ApiError {
    if e.is_not_found() {
        warn!("{}: {}", context, e);
        api_error(StatusCode::NOT_FOUND, e.to_string())
    } else if let StorageError::DuplicateReference(_) = e {
        warn!("{}: {}", context, e);
        api_error(StatusCode::CONFLICT, e.to_string())
    } else {
        error!("{}: {}", context, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {e}"))
    }
}

fn timeline_error(context: &str, e: &TimelineError) -> ApiError {
    match e {
        TimelineError::Storage(e) => storage_error(context, e),
    }
}

fn supersession_error(context: &str, e: &SupersessionError) -> ApiError {
    match e {
        SupersessionError::Storage(e) => storage_error(context, e),
        SupersessionError::UnsupportedOperation(_) => {
            warn!("{}: {}", context, e);
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        SupersessionError::Timeline(_) | SupersessionError::Superseded => {
            error!("{}: {}", context, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{context}: {e}"))
        }
    }
}

fn stage_error(context: &str, e: &StageTrackerError) -> ApiError {
    match e {
        StageTrackerError::Storage(e) => storage_error(context, e),
    }
}

fn history_error(context: &str, e: &HistoryError) -> ApiError {
    match e {
        HistoryError::Storage(e) => storage_error(context, e),
        HistoryError::Snapshot(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// Validate auth token if configured.
fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub pipeline: Pipeline,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListPipelinesResponse {
    pub pipelines: Vec<Pipeline>,
}

/// Request payload for POST /deployments.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub app_name: String,
    pub environment_id: i64,
    pub environment_name: String,
    pub namespace: String,
    pub deployment_app_type: DeploymentAppType,
    pub chart_repo_url: String,
    pub chart_name: String,
    pub chart_version: String,
    #[serde(default)]
    pub values_override_yaml: String,
    pub user_id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDeploymentResponse {
    pub version: InstalledAppVersion,
    pub history_id: Id,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub version: InstalledAppVersion,
}

/// Request payload for POST /deployments/{id}/deploy.
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    /// Reuse an existing history record; a new one is created when absent.
    #[serde(default)]
    pub history_id: Option<Id>,
    pub user_id: i32,
    /// Run to stamp with the trigger's message id once the deploy succeeds.
    #[serde(default)]
    pub run_id: Option<Id>,
}

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub history_id: Id,
    pub results: Vec<EnqueueResult>,
}

/// Request payload for POST /runs.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub pipeline_id: i64,
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub release_kind: ReleaseKind,
    pub name: String,
    pub triggered_by: i32,
    #[serde(default)]
    pub reference_id: Option<String>,
    /// Configuration shipped with this run, recorded as history.
    #[serde(default)]
    pub snapshot: Option<DeploymentSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateRunResponse {
    pub run: DeploymentRun,
    pub superseded: Vec<Id>,
}

/// Query params for GET /runs.
#[derive(Debug, Deserialize, Default)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<DeploymentRun>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub run: DeploymentRun,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimelineResponse {
    pub timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StagesResponse {
    pub stages: std::collections::BTreeMap<String, Vec<WorkflowStage>>,
}

/// Request payload for POST /runs/{id}/status.
#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub user_id: i32,
}

/// Request payload for POST /runs/{id}/fail.
#[derive(Debug, Deserialize)]
pub struct FailRunRequest {
    #[serde(default)]
    pub message: String,
    /// Record the failure as a supersession.
    #[serde(default)]
    pub superseded: bool,
    pub user_id: i32,
}

/// Request payload for POST /pipelines/{id}/supersede.
#[derive(Debug, Deserialize)]
pub struct SupersedeRequest {
    pub run_id: Id,
    pub user_id: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SupersedeResponse {
    pub superseded: Vec<Id>,
    pub queued: Vec<Id>,
}

/// Query params for GET /pipelines/{id}/configuration.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigurationQuery {
    #[serde(default)]
    pub run_id: Option<String>,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST /pipelines - Create or update a pipeline.
async fn upsert_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(pipeline): Json<Pipeline>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    state
        .storage
        .upsert_pipeline(&pipeline)
        .await
        .map_err(|e| storage_error("failed to save pipeline", &e))?;

    info!(pipeline_id = pipeline.id, app = %pipeline.deployment_app_name, "pipeline saved");
    Ok((StatusCode::CREATED, Json(PipelineResponse { pipeline })))
}

/// GET /pipelines - List pipelines.
async fn list_pipelines(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let pipelines = state
        .storage
        .list_pipelines()
        .await
        .map_err(|e| storage_error("failed to list pipelines", &e))?;
    Ok(Json(ListPipelinesResponse { pipelines }))
}

/// GET /pipelines/{id} - Get a single pipeline.
async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let pipeline = state
        .storage
        .get_pipeline(id)
        .await
        .map_err(|e| storage_error("failed to load pipeline", &e))?;
    Ok(Json(PipelineResponse { pipeline }))
}

/// POST /pipelines/{id}/supersede - Fence every older in-flight run.
async fn supersede_pipeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<SupersedeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let superseded = state
        .supersession
        .supersede_previous_deployments(&req.run_id, id, Utc::now(), req.user_id)
        .await
        .map_err(|e| supersession_error("failed to supersede deployments", &e))?;
    let queued = state
        .supersession
        .update_previous_queued_runner_status(&req.run_id, id, req.user_id)
        .await
        .map_err(|e| supersession_error("failed to supersede queued runs", &e))?;

    Ok(Json(SupersedeResponse { superseded, queued }))
}

/// GET /pipelines/{id}/resource-tree - Live resource tree and app status.
async fn resource_tree(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<AppResourceTree>, ApiError> {
    check_auth(&state, &headers)?;

    let tree = state
        .reconciler
        .fetch_resource_tree(id)
        .await
        .map_err(|e| match e {
            ReconcileError::Storage(e) => storage_error("failed to fetch resource tree", &e),
            ReconcileError::Timeline(e) => timeline_error("failed to fetch resource tree", &e),
            ReconcileError::Cluster(e) => {
                warn!(pipeline_id = id, error = %e, "resource tree unavailable");
                api_error(
                    StatusCode::BAD_GATEWAY,
                    format!("error fetching resource tree: {e}"),
                )
            }
        })?;
    Ok(Json(tree))
}

/// GET /pipelines/{id}/configuration - Deployed configuration history.
async fn deployed_configuration(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Query(query): Query<ConfigurationQuery>,
) -> Result<Json<DeployedConfiguration>, ApiError> {
    check_auth(&state, &headers)?;

    let config = match query.run_id {
        Some(run_id) => {
            state
                .history
                .deployed_configuration_by_run(id, &Id::from_string(run_id))
                .await
        }
        None => state.history.latest_deployed_configuration(id).await,
    }
    .map_err(|e| history_error("failed to load configuration", &e))?;
    Ok(Json(config))
}

/// POST /deployments - Register an installed app version.
async fn create_deployment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let now = Utc::now();
    let version = InstalledAppVersion {
        id: Id::new(),
        app_name: req.app_name,
        environment_id: req.environment_id,
        environment_name: req.environment_name,
        namespace: req.namespace,
        deployment_app_type: req.deployment_app_type,
        chart_repo_url: req.chart_repo_url,
        chart_name: req.chart_name,
        chart_version: req.chart_version,
        values_override_yaml: req.values_override_yaml,
        progress: deploy_core::DeployProgress::default(),
        git_hash: None,
        gitops_repo_url: None,
        target_revision: None,
        user_id: req.user_id,
        created_at: now,
        updated_at: now,
    };
    state
        .storage
        .insert_app_version(&version)
        .await
        .map_err(|e| storage_error("failed to create deployment", &e))?;
    let history_id = new_history(&state, &version.id, req.user_id).await?;

    info!(version_id = %version.id, app = %version.deployment_app_name(), "deployment created");
    Ok((
        StatusCode::CREATED,
        Json(CreateDeploymentResponse {
            version,
            history_id,
        }),
    ))
}

async fn new_history(state: &AppState, version_id: &Id, user_id: i32) -> Result<Id, ApiError> {
    let history = InstalledAppVersionHistory {
        id: Id::new(),
        version_id: version_id.clone(),
        git_hash: None,
        created_by: user_id,
        created_at: Utc::now(),
    };
    state
        .storage
        .insert_app_version_history(&history)
        .await
        .map_err(|e| storage_error("failed to create deployment history", &e))?;
    Ok(history.id)
}

/// GET /deployments/{id} - Get an installed app version.
async fn get_deployment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let version = state
        .storage
        .get_app_version(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("failed to load deployment", &e))?;
    Ok(Json(DeploymentResponse { version }))
}

/// POST /deployments/{id}/deploy - Enqueue the deploy stage of a version.
async fn deploy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let version_id = Id::from_string(id);
    state
        .storage
        .get_app_version(&version_id)
        .await
        .map_err(|e| storage_error("failed to load deployment", &e))?;
    if let Some(run_id) = &req.run_id {
        let run = state
            .storage
            .get_run(run_id)
            .await
            .map_err(|e| storage_error("failed to load run", &e))?;
        if let Some(reference_id) = run.reference_id {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("run {run_id} is already bound to message {reference_id}"),
            ));
        }
    }
    let history_id = match req.history_id {
        Some(history_id) => {
            state
                .storage
                .get_app_version_history(&history_id)
                .await
                .map_err(|e| storage_error("failed to load deployment history", &e))?;
            history_id
        }
        None => new_history(&state, &version_id, req.user_id).await?,
    };

    let results = state
        .orchestrator
        .enqueue_deployments(
            &state.queue,
            vec![DeployTrigger {
                version_id,
                history_id: history_id.clone(),
                user_id: req.user_id,
                run_id: req.run_id,
            }],
        )
        .await
        .map_err(|e| {
            error!("failed to enqueue deployment: {}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to enqueue deployment: {e}"),
            )
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DeployResponse {
            history_id,
            results,
        }),
    ))
}

/// GET /histories/{id}/timeline - Timeline of one deploy request.
async fn history_timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let timeline = state
        .timelines
        .list(&TimelineOwner::AppHistory(Id::from_string(id)))
        .await
        .map_err(|e| timeline_error("failed to list timeline", &e))?;
    Ok(Json(TimelineResponse { timeline }))
}

/// POST /runs - Start a run, fencing older deploy runs of the pipeline.
async fn create_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    state
        .storage
        .get_pipeline(req.pipeline_id)
        .await
        .map_err(|e| storage_error("failed to load pipeline", &e))?;

    let mut run = DeploymentRun::new(
        req.pipeline_id,
        req.workflow_type,
        req.name,
        RunStatus::Starting,
        req.triggered_by,
    );
    run.release_kind = req.release_kind;
    run.reference_id = req.reference_id;
    state
        .storage
        .insert_run(&run)
        .await
        .map_err(|e| storage_error("failed to create run", &e))?;

    let mut superseded = Vec::new();
    if run.workflow_type.is_deploy() {
        superseded = state
            .supersession
            .supersede_previous_deployments(&run.id, run.pipeline_id, run.created_at, run.triggered_by)
            .await
            .map_err(|e| supersession_error("failed to supersede deployments", &e))?;
        let queued = state
            .supersession
            .update_previous_queued_runner_status(&run.id, run.pipeline_id, run.triggered_by)
            .await
            .map_err(|e| supersession_error("failed to supersede queued runs", &e))?;
        superseded.extend(queued);
    }

    state
        .stages
        .save_workflow_stages(&run.id, run.workflow_type, &run.name)
        .await
        .map_err(|e| stage_error("failed to save workflow stages", &e))?;

    if let Some(snapshot) = &req.snapshot {
        state
            .history
            .create_histories_for_deployment_trigger(
                run.pipeline_id,
                snapshot,
                run.created_at,
                run.triggered_by,
                Some(&run.id),
            )
            .await
            .map_err(|e| history_error("failed to record configuration", &e))?;
    }

    info!(run_id = %run.id, pipeline_id = run.pipeline_id, superseded = superseded.len(), "created run");
    Ok((StatusCode::CREATED, Json(CreateRunResponse { run, superseded })))
}

/// GET /runs - List runs.
async fn list_runs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let mut runs = state
        .storage
        .list_runs(query.pipeline_id)
        .await
        .map_err(|e| storage_error("failed to list runs", &e))?;

    if let Some(status_filter) = &query.status {
        runs.retain(|r| r.status.as_str().eq_ignore_ascii_case(status_filter));
    }

    Ok(Json(ListRunsResponse { runs }))
}

async fn load_run(state: &AppState, id: String) -> Result<DeploymentRun, ApiError> {
    state
        .storage
        .get_run(&Id::from_string(id))
        .await
        .map_err(|e| storage_error("failed to load run", &e))
}

/// GET /runs/{id} - Get a single run.
async fn get_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = load_run(&state, id).await?;
    Ok(Json(RunResponse { run }))
}

/// GET /runs/{id}/timeline - Status milestones of a run.
async fn run_timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = load_run(&state, id).await?;
    let timeline = state
        .timelines
        .list(&TimelineOwner::Runner(run.id))
        .await
        .map_err(|e| timeline_error("failed to list timeline", &e))?;
    Ok(Json(TimelineResponse { timeline }))
}

/// GET /runs/{id}/stages - Stage records grouped by workflow/pod.
async fn run_stages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = load_run(&state, id).await?;
    let stages = state
        .stages
        .stages_for_run(&run.id, run.workflow_type)
        .await
        .map_err(|e| stage_error("failed to list stages", &e))?;
    Ok(Json(StagesResponse { stages }))
}

/// GET /runs/{id}/report - Timeline report as TSV.
async fn run_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(id);
    tokio::fs::create_dir_all(&state.reports_dir)
        .await
        .map_err(|e| {
            error!("failed to create reports dir: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    let path = state.reports_dir.join(format!("run-{run_id}.tsv"));
    state
        .storage
        .export_timeline_report(&run_id, &path)
        .await
        .map_err(|e| storage_error("failed to export report", &e))?;
    let body = tokio::fs::read_to_string(&path).await.map_err(|e| {
        error!("failed to read report {}: {}", path.display(), e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(([(header::CONTENT_TYPE, "text/tab-separated-values")], body))
}

/// POST /runs/{id}/status - Write a non-terminal status.
async fn update_run_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = state
        .supersession
        .update_non_terminal_status_in_runner(
            &Id::from_string(id),
            req.user_id,
            RunStatus::parse(&req.status),
        )
        .await
        .map_err(|e| supersession_error("failed to update run status", &e))?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/fail - Fail a run and record why.
async fn fail_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<FailRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run_id = Id::from_string(id);
    let result = if req.superseded {
        state
            .supersession
            .mark_deployment_failed_for_runner_id(&run_id, &SupersessionError::Superseded, req.user_id)
            .await
    } else {
        state
            .supersession
            .mark_deployment_failed_for_runner_id(&run_id, &ReleaseError(req.message), req.user_id)
            .await
    };
    let run = result.map_err(|e| supersession_error("failed to mark run failed", &e))?;
    Ok(Json(RunResponse { run }))
}

/// POST /runs/{id}/workflow-status - Ingest a workflow engine report.
async fn workflow_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(update): Json<WorkflowStatusUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;

    let run = state
        .stages
        .ingest(&Id::from_string(id), &update)
        .await
        .map_err(|e| stage_error("failed to ingest workflow status", &e))?;
    Ok(Json(RunResponse { run }))
}
