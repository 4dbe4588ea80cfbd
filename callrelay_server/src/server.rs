//! HTTP surface: WebSocket upgrade, health check, static client files.

use crate::config::Config;
use crate::connection::handle_connection;
use crate::handler::MessageRouter;
use crate::liveness::LivenessConfig;
use crate::state::ServerState;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use std::path::Path;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handles given to every connection
#[derive(Debug, Clone)]
pub struct AppState {
    pub state: ServerState,
    pub router: MessageRouter,
    pub liveness: LivenessConfig,
    pub outbox_capacity: usize,
    /// Cancelled on shutdown; every connection's close signal is a child
    pub shutdown: CancellationToken,
    pub connections: TaskTracker,
}

impl AppState {
    pub fn new(config: &Config, shutdown: CancellationToken) -> Self {
        let state = ServerState::new();
        Self {
            router: MessageRouter::new(&state),
            state,
            liveness: config.liveness(),
            outbox_capacity: config.outbox_capacity,
            shutdown,
            connections: TaskTracker::new(),
        }
    }
}

/// Build the HTTP routes
pub fn build_router(app: AppState, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let connections = app.connections.clone();
        connections.track_future(handle_connection(socket, app))
    })
}

async fn health() -> &'static str {
    "OK"
}

/// Serve until `shutdown` is cancelled, then wait for every connection to
/// finish its teardown
pub async fn serve(
    listener: TcpListener,
    config: &Config,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = AppState::new(config, shutdown.clone());
    let connections = app.connections.clone();
    let routes = build_router(app, &config.static_dir);

    let signal = shutdown.clone();
    axum::serve(listener, routes)
        .with_graceful_shutdown(async move { signal.cancelled().await })
        .await?;

    // Connections hold child tokens of `shutdown`, so they are already closing
    shutdown.cancel();
    connections.close();
    info!(remaining = connections.len(), "waiting for connections to close");
    connections.wait().await;
    Ok(())
}
