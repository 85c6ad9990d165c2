use crate::assistant::{Assistant, LlmAssistant, LlmConfig};
use crate::config::AppConfig;
use crate::errors::AppError;
use crate::inflight::InFlight;
use crate::routes::AppState;
use ::llm::builder::LLMBackend;
use axum::http::header;
use axum::middleware::map_response;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use axum_prometheus::PrometheusMetricLayer;
use clap::{Parser, Subcommand};
use kube::config::KubeConfigOptions;
use podlens_core::catalog::RenderParams;
use podlens_core::control_plane::{ControlPlane, KubeControlPlane};
use podlens_core::dashboard::DashboardCoordinator;
use podlens_core::gateway::PrometheusGateway;
use podlens_core::mutation::{MutationOrchestrator, MutationRequest, ResourceSettings};
use podlens_core::validation::Level;
use podlens_core::views::ViewKind;
use shadow_rs::shadow;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::signal;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::propagate_header::PropagateHeaderLayer;
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace;
use tracing::{info, warn};

mod assistant;
mod config;
pub mod errors;
mod inflight;
pub mod logger;
mod routes;

shadow!(build);

const PROMETHEUS_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "podlens-app")]
#[command(about = "Kubernetes workload dashboard, mutation and assistant service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[arg(long, env = "PROMETHEUS_URL", default_value = "http://localhost:9090")]
    prometheus_url: String,
    #[arg(long, env = "KUBE_CONTEXT")]
    kube_context: Option<String>,
    #[arg(long, env = "KUBE_NAMESPACE")]
    kube_namespace: Option<String>,
    #[arg(long, env = "HTTP_HOST", default_value = "127.0.0.1")]
    http_host: String,
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    http_port: u16,
    #[arg(long, env = "PODLENS_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "LLM_BACKEND", default_value = "openai")]
    llm_backend: LLMBackend,
    #[arg(long, env = "LLM_BASE_URL")]
    llm_base_url: Option<String>,
    #[arg(long, env = "LLM_MODEL")]
    llm_model: Option<String>,
    #[arg(long, env = "LLM_API_KEY")]
    llm_api_key: Option<String>,
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value_t = 60)]
    llm_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Delete a pod and wait until it is gone.
    Restart {
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        pod: String,
    },
    /// Set a deployment's replica count and wait for it to converge.
    Scale {
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        deployment: String,
        #[arg(long)]
        replicas: i32,
    },
    /// Set requests and limits of a deployment's first container.
    SetResources {
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        deployment: String,
        #[arg(long)]
        cpu_request: String,
        #[arg(long)]
        cpu_limit: String,
        #[arg(long)]
        memory_request: String,
        #[arg(long)]
        memory_limit: String,
    },
}

impl Command {
    fn request(&self, default_namespace: &str) -> errors::Result<MutationRequest> {
        let ns = |namespace: &Option<String>| {
            namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string())
        };
        let request = match self {
            Command::Restart { namespace, pod } => MutationRequest::restart(&ns(namespace), pod)?,
            Command::Scale {
                namespace,
                deployment,
                replicas,
            } => MutationRequest::scale(&ns(namespace), deployment, *replicas)?,
            Command::SetResources {
                namespace,
                deployment,
                cpu_request,
                cpu_limit,
                memory_request,
                memory_limit,
            } => {
                let settings =
                    ResourceSettings::new(cpu_request, cpu_limit, memory_request, memory_limit)?;
                MutationRequest::set_resources(&ns(namespace), deployment, settings)?
            }
        };
        Ok(request)
    }
}

pub const APP_VERSION: &str = shadow_rs::formatcp!(
    "{} ({} {}), build_env: {}, {}, {}",
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL,
    build::CARGO_VERSION
);

async fn set_version_header<B>(mut res: Response<B>) -> Response<B> {
    match APP_VERSION.parse() {
        Ok(value) => {
            res.headers_mut().insert("x-version-id", value);
        }
        Err(err) => {
            warn!("Failed to parse x-version-id header value: {err}");
        }
    }
    res
}

async fn refresh_views(
    coordinator: Arc<DashboardCoordinator>,
    views: Vec<(ViewKind, RenderParams)>,
    token: CancellationToken,
    interval: Duration,
) -> errors::Result<()> {
    info!("Starting refresh_views with interval {interval:?}");
    let mut id: usize = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                break;
            },
            _ = sleep(interval) => {
                coordinator.refresh_all(&views).await;
                id += 1;
            },
        }
    }
    info!("Stopped refresh_views, number of ticks {id}");
    Ok(())
}

async fn run_command(
    orchestrator: &MutationOrchestrator,
    command: &Command,
    default_namespace: &str,
) -> errors::Result<()> {
    let request = command.request(default_namespace)?;
    info!("Running {request}");
    let outcome = orchestrator.run(&request).await;
    let outcome = routes::settle(&request, outcome)?;
    let rendered = serde_json::to_string_pretty(&outcome)
        .map_err(|err| AppError::from(std::io::Error::other(err)))?;
    println!("{rendered}");
    Ok(())
}

fn build_assistant(cli: &Cli) -> Option<Arc<dyn Assistant>> {
    let (Some(base_url), Some(model)) = (&cli.llm_base_url, &cli.llm_model) else {
        info!("LLM_BASE_URL or LLM_MODEL not set, assistant disabled");
        return None;
    };
    let config = LlmConfig {
        backend: cli.llm_backend.clone(),
        base_url: base_url.clone(),
        model: model.clone(),
        api_key: cli.llm_api_key.clone(),
        timeout_secs: cli.llm_timeout_secs,
    };
    match LlmAssistant::try_new(&config) {
        Ok(assistant) => {
            info!("Assistant enabled with model {model} at {base_url}");
            Some(Arc::new(assistant) as Arc<dyn Assistant>)
        }
        Err(err) => {
            warn!("Assistant disabled: {err}");
            None
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> errors::Result<()> {
    logger::setup("podlens_app", "INFO");

    let cli = Cli::parse();
    info!("podlens-app {APP_VERSION}");

    let config = AppConfig::load(cli.config.as_deref())?;

    let kube_namespace: Option<String> = cli.kube_namespace.clone();
    info!(
        "KUBE_CONTEXT: {:?}, KUBE_NAMESPACE: {kube_namespace:?}",
        cli.kube_context
    );
    let kube_opts = KubeConfigOptions {
        context: cli.kube_context.clone(),
        cluster: None,
        user: None,
    };
    let control_plane: Arc<dyn ControlPlane> = Arc::new(KubeControlPlane::new(&kube_opts).await?);
    let orchestrator = Arc::new(MutationOrchestrator::new(
        control_plane.clone(),
        config.policies(),
    ));

    if let Some(command) = &cli.command {
        let default_namespace = kube_namespace.as_deref().unwrap_or("default");
        return run_command(&orchestrator, command, default_namespace).await;
    }

    info!("PROMETHEUS_URL: {}", cli.prometheus_url);
    let gateway = PrometheusGateway::new(&cli.prometheus_url, PROMETHEUS_TIMEOUT)?;
    let coordinator = Arc::new(DashboardCoordinator::new(Arc::new(gateway)));

    let default_window = config.default_window()?;
    let views: Vec<(ViewKind, RenderParams)> = ViewKind::iter()
        .map(|view| {
            let params = RenderParams::new(Level::Pod, default_window, kube_namespace.clone());
            (view, params)
        })
        .collect();
    coordinator.refresh_all(&views).await;

    let state = AppState {
        coordinator: coordinator.clone(),
        orchestrator,
        control_plane,
        assistant: build_assistant(&cli),
        in_flight: InFlight::default(),
        config: Arc::new(config.clone()),
    };

    let token: CancellationToken = CancellationToken::new();

    let main_router = routes::create_route(state);
    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
    let route = Router::new()
        .merge(main_router)
        .route(
            "/render/metrics",
            get(|| async move { metric_handle.render() }),
        )
        .layer(prometheus_layer)
        .layer(map_response(set_version_header))
        .layer(
            trace::TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().include_headers(true))
                .on_request(trace::DefaultOnRequest::new().level(tracing::Level::DEBUG))
                .on_response(trace::DefaultOnResponse::new().level(tracing::Level::DEBUG)),
        )
        // Keep bearer tokens out of the request logs.
        .layer(SetSensitiveHeadersLayer::new(std::iter::once(
            header::AUTHORIZATION,
        )))
        .layer(CompressionLayer::new())
        .layer(PropagateHeaderLayer::new(header::HeaderName::from_static(
            "x-request-id",
        )))
        .layer(CorsLayer::permissive());

    let http_addr: SocketAddr = format!("{}:{}", cli.http_host, cli.http_port)
        .parse()
        .map_err(|err| {
            AppError::from(std::io::Error::new(std::io::ErrorKind::InvalidInput, err))
        })?;
    let svc = route.into_make_service_with_connect_info::<SocketAddr>();
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let shutdown_token = token.clone();
    let server: tokio::task::JoinHandle<errors::Result<()>> = tokio::spawn(async move {
        axum::serve(http_listener, svc)
            .with_graceful_shutdown(shutdown_signal(shutdown_token))
            .await?;
        Ok(())
    });

    info!("podlens is running on http://{http_addr}");

    let refresh_token = token.clone();
    let refresh_interval = config.refresh_interval();
    let refresher = tokio::spawn(async move {
        refresh_views(coordinator, views, refresh_token, refresh_interval).await
    });

    let (server_result, refresh_result) = tokio::join!(server, refresher);
    server_result.map_err(|err| AppError::from(std::io::Error::other(err)))??;
    refresh_result.map_err(|err| AppError::from(std::io::Error::other(err)))??;
    info!("Server shutdown");

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to install signal handler: {err}");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            token.cancel()
        },
        _ = terminate => {
            token.cancel()
        },
    }

    info!("signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subcommands_build_validated_requests() {
        let cli = Cli::try_parse_from([
            "podlens-app",
            "scale",
            "--namespace",
            "shop",
            "--deployment",
            "api",
            "--replicas",
            "3",
        ])
        .unwrap();
        let request = cli.command.unwrap().request("default").unwrap();
        assert_eq!(request.to_string(), "scale_replicas of shop/api");

        let cli = Cli::try_parse_from(["podlens-app", "restart", "--pod", "api-1"]).unwrap();
        let request = cli.command.unwrap().request("staging").unwrap();
        assert_eq!(request.namespace(), "staging");
    }

    #[test]
    fn negative_replicas_are_rejected() {
        let cli = Cli::try_parse_from([
            "podlens-app",
            "scale",
            "--deployment",
            "api",
            "--replicas=-1",
        ])
        .unwrap();
        assert!(cli.command.unwrap().request("default").is_err());
    }
}
