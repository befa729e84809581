//! `RelayServer` — Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_wire::SplitAccumulator;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::invoke::{AuthHook, MethodInvoker};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::SessionRegistry;
use crate::websocket::session::{SessionDeps, run_session};
use crate::websocket::upload::UploadManager;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session collaborators handed to every upgraded socket.
    pub deps: Arc<SessionDeps>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Renders `/metrics` when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    deps: Arc<SessionDeps>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RelayServer {
    /// Create a new server around an application invoker.
    pub fn new(config: ServerConfig, invoker: Arc<dyn MethodInvoker>) -> Self {
        Self::with_auth(config, invoker, None)
    }

    /// Create a new server with an auth hook behind `auth.resume`.
    pub fn with_auth(
        config: ServerConfig,
        invoker: Arc<dyn MethodInvoker>,
        auth: Option<Arc<dyn AuthHook>>,
    ) -> Self {
        let deps = Arc::new(SessionDeps {
            registry: Arc::new(SessionRegistry::new()),
            accumulator: Arc::new(SplitAccumulator::new()),
            uploads: Arc::new(UploadManager::new()),
            invoker,
            auth,
            config,
        });
        Self {
            deps,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Attach an installed Prometheus recorder handle for `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            deps: self.deps.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.deps.config.host, self.deps.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned());
            if let Err(e) = serve.await {
                warn!(error = %e, "server error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Stop admitting, terminate every session, and wait for the serve
    /// task, bounded by the configured shutdown timeout.
    ///
    /// Returns `true` if everything drained within the cap.
    pub async fn graceful_shutdown(&self, serve_task: JoinHandle<()>) -> bool {
        self.deps.registry.terminate_all().await;
        let timeout = Duration::from_millis(self.deps.config.shutdown_timeout_ms);
        self.shutdown
            .graceful_shutdown(vec![serve_task], Some(timeout))
            .await
    }

    /// Get the session registry (event emission entry point).
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.deps.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.deps.config
    }
}

/// GET /ws — WebSocket upgrade into a relay session.
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let deps = state.deps.clone();
    let token = state.shutdown.token();
    ws.max_message_size(state.deps.config.max_message_size)
        .on_upgrade(move |socket| run_session(socket, deps, token))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.deps.registry.connection_count().await;
    Json(health::health_check(state.start_time, connections))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
