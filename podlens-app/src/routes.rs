use crate::assistant::Assistant;
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::inflight::InFlight;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use podlens_core::alignment::MeanPolicy;
use podlens_core::catalog::RenderParams;
use podlens_core::context::{gather, AssistantContext, ContextRequest};
use podlens_core::control_plane::ControlPlane;
use podlens_core::dashboard::{DashboardCoordinator, HistoryRequest, HistoryView};
use podlens_core::errors::PodlensError;
use podlens_core::mutation::{
    MutationOrchestrator, MutationOutcome, MutationRequest, ObservedResources, ResourceSettings,
};
use podlens_core::snapshot::Snapshot;
use podlens_core::validation::{
    validate_namespace, validate_object_name, LatencyDirection, Level, MetricKind, RangeParams,
    TimeWindow,
};
use podlens_core::views::{HistoryMetric, ViewKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DashboardCoordinator>,
    pub orchestrator: Arc<MutationOrchestrator>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub assistant: Option<Arc<dyn Assistant>>,
    pub in_flight: InFlight,
    pub config: Arc<AppConfig>,
}

pub fn create_route(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/render/v1/pods", get(get_pod_status))
        .route("/render/v1/resources", get(get_resources))
        .route("/render/v1/latency", get(get_latency))
        .route("/render/v1/history/usage", get(get_usage_history))
        .route("/render/v1/history/latency", get(get_latency_history))
        .route("/render/v1/deployments", get(get_deployments))
        .route("/render/v1/pods/{namespace}/{pod}/logs", get(get_pod_logs))
        .route("/render/v1/pods/{namespace}/{pod}/restart", post(restart_pod))
        .route(
            "/render/v1/deployments/{namespace}/{name}/scale",
            post(scale_deployment),
        )
        .route(
            "/render/v1/deployments/{namespace}/{name}/resources",
            post(set_resources),
        )
        .route("/render/v1/assistant/chat", post(chat))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn optional_namespace(raw: Option<&str>) -> Result<Option<String>> {
    match raw.map(str::trim).filter(|ns| !ns.is_empty()) {
        Some(ns) => Ok(Some(validate_namespace(ns)?.to_string())),
        None => Ok(None),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ViewParams {
    pub level: Option<String>,
    pub window: Option<String>,
    pub namespace: Option<String>,
}

impl ViewParams {
    fn render_params(&self, default_window: TimeWindow) -> Result<RenderParams> {
        let level = match &self.level {
            Some(raw) => Level::parse(raw)?,
            None => Level::Pod,
        };
        let window = match &self.window {
            Some(raw) => TimeWindow::parse(raw)?,
            None => default_window,
        };
        let namespace = optional_namespace(self.namespace.as_deref())?;
        Ok(RenderParams::new(level, window, namespace))
    }
}

async fn render_view(state: &AppState, view: ViewKind, params: &ViewParams) -> Result<Snapshot> {
    let params = params.render_params(state.config.default_window()?)?;
    let snapshot = state.coordinator.refresh(view, &params).await;
    if snapshot.partial() {
        warn!(
            "{view} served with failed queries {:?}, stale fields {:?}",
            snapshot.failed_queries, snapshot.stale_fields
        );
    }
    Ok(snapshot)
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_pod_status(
    State(state): State<AppState>,
    Query(params): Query<ViewParams>,
) -> Result<Json<Snapshot>> {
    Ok(Json(render_view(&state, ViewKind::PodStatus, &params).await?))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_resources(
    State(state): State<AppState>,
    Query(params): Query<ViewParams>,
) -> Result<Json<Snapshot>> {
    Ok(Json(render_view(&state, ViewKind::Resources, &params).await?))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_latency(
    State(state): State<AppState>,
    Query(params): Query<ViewParams>,
) -> Result<Json<Snapshot>> {
    Ok(Json(render_view(&state, ViewKind::Latency, &params).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub metric: Option<String>,
    pub relative: Option<bool>,
    pub direction: Option<String>,
    pub level: Option<String>,
    pub namespace: Option<String>,
    pub entity: Option<String>,
    pub start: String,
    pub end: String,
    pub step: String,
    pub mean: Option<String>,
}

impl HistoryParams {
    fn request(&self, metric: HistoryMetric) -> Result<HistoryRequest> {
        let level = match &self.level {
            Some(raw) => Level::parse(raw)?,
            None => Level::Pod,
        };
        let mean_policy = match self.mean.as_deref() {
            None | Some("present_only") => MeanPolicy::PresentOnly,
            Some("zero_fill") => MeanPolicy::ZeroFill,
            Some(other) => {
                return Err(PodlensError::validation(format!(
                    "mean must be one of present_only|zero_fill, got `{other}`"
                ))
                .into())
            }
        };
        Ok(HistoryRequest {
            metric,
            level,
            namespace: optional_namespace(self.namespace.as_deref())?,
            range: RangeParams::parse(&self.start, &self.end, &self.step)?,
            entity: self.entity.clone().filter(|e| !e.trim().is_empty()),
            mean_policy,
        })
    }
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_usage_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryView>> {
    let metric = MetricKind::parse(params.metric.as_deref().unwrap_or_default())?;
    let request = params.request(HistoryMetric::Usage {
        metric,
        relative: params.relative.unwrap_or(false),
    })?;
    Ok(Json(state.coordinator.history(&request).await?))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_latency_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryView>> {
    let direction = match params.direction.as_deref() {
        Some(raw) => LatencyDirection::parse(raw)?,
        None => LatencyDirection::Combined,
    };
    let request = params.request(HistoryMetric::Latency { direction })?;
    Ok(Json(state.coordinator.history(&request).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceParams {
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSummary {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    /// Requests and limits of the first container.
    pub resources: Option<ObservedResources>,
}

impl From<&Deployment> for DeploymentSummary {
    fn from(deployment: &Deployment) -> Self {
        let status = deployment.status.as_ref();
        let resources = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.first())
            .map(ObservedResources::from_container);
        DeploymentSummary {
            namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
            name: deployment.metadata.name.clone().unwrap_or_default(),
            replicas: deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.replicas)
                .unwrap_or(1),
            ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
            available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
            resources,
        }
    }
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_deployments(
    State(state): State<AppState>,
    Query(params): Query<NamespaceParams>,
) -> Result<Json<Vec<DeploymentSummary>>> {
    let namespace = optional_namespace(params.namespace.as_deref())?;
    let deployments = state
        .control_plane
        .list_deployments(namespace.as_deref())
        .await?;
    Ok(Json(deployments.iter().map(DeploymentSummary::from).collect()))
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    pub container: Option<String>,
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn get_pod_logs(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Query(params): Query<LogParams>,
) -> Result<String> {
    validate_namespace(&namespace)?;
    validate_object_name(&pod)?;
    Ok(state
        .control_plane
        .get_pod_logs(&namespace, &pod, params.container)
        .await?)
}

/// Maps an orchestrator outcome onto the caller-facing result.
pub fn settle(request: &MutationRequest, outcome: MutationOutcome) -> Result<MutationOutcome> {
    match outcome {
        MutationOutcome::Succeeded { .. } => Ok(outcome),
        MutationOutcome::Failed { reason } => Err(AppError::mutation_failed(reason)),
        MutationOutcome::TimedOut { last_observed } => {
            warn!("{request} unconfirmed, last observed {last_observed:?}");
            Err(AppError::mutation_timed_out(format!(
                "could not confirm {request} - please check manually"
            )))
        }
    }
}

async fn run_mutation(state: &AppState, request: MutationRequest) -> Result<Json<MutationOutcome>> {
    let Some(_guard) = state
        .in_flight
        .try_acquire(request.namespace(), request.target())
    else {
        return Err(AppError::in_flight(format!(
            "a mutation of {}/{} is already running",
            request.namespace(),
            request.target()
        )));
    };
    info!("Running {request}");
    let outcome = state.orchestrator.run(&request).await;
    Ok(Json(settle(&request, outcome)?))
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn restart_pod(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
) -> Result<Json<MutationOutcome>> {
    let request = MutationRequest::restart(&namespace, &pod)?;
    run_mutation(&state, request).await
}

#[derive(Debug, Deserialize)]
pub struct ScaleBody {
    pub replicas: i32,
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn scale_deployment(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(body): Json<ScaleBody>,
) -> Result<Json<MutationOutcome>> {
    let request = MutationRequest::scale(&namespace, &name, body.replicas)?;
    run_mutation(&state, request).await
}

#[derive(Debug, Deserialize)]
pub struct ResourcesBody {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

#[tracing::instrument(level = "INFO", skip(state))]
async fn set_resources(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(body): Json<ResourcesBody>,
) -> Result<Json<MutationOutcome>> {
    let settings = ResourceSettings::new(
        &body.cpu_request,
        &body.cpu_limit,
        &body.memory_request,
        &body.memory_limit,
    )?;
    let request = MutationRequest::set_resources(&namespace, &name, settings)?;
    run_mutation(&state, request).await
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    pub entity: Option<String>,
    pub namespace: Option<String>,
    pub window: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatReply {
    pub answer: String,
    pub context: AssistantContext,
}

#[tracing::instrument(level = "INFO", skip(state, body))]
async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Result<Json<ChatReply>> {
    let Some(assistant) = state.assistant.clone() else {
        return Err(AppError::assistant_disabled());
    };
    if body.message.trim().is_empty() {
        return Err(PodlensError::validation("message must not be empty").into());
    }
    let window = match &body.window {
        Some(raw) => TimeWindow::parse(raw)?,
        None => state.config.default_window()?,
    };
    let settings = &state.config.assistant;
    let request = ContextRequest {
        entity: body.entity.clone().filter(|e| !e.trim().is_empty()),
        namespace: optional_namespace(body.namespace.as_deref())?,
        window,
        now: Utc::now().timestamp() as f64,
        span_secs: settings.history_span_secs,
        step_secs: settings.history_step_secs,
        max_points: settings.max_points,
    };
    let context = gather(&state.coordinator, &request).await?;
    let answer = assistant.answer(&context, &body.message).await?;
    Ok(Json(ChatReply { answer, context }))
}
