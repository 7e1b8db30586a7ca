//! Control-plane server: an axum router served on a Unix socket.
//!
//! The control socket goes through the same [`SocketPath`] claim as the
//! ingestion endpoints: a stale file is replaced, a live daemon is refused,
//! and the path is unlinked once serving stops.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

use eventgate_config::AppConfig;

use super::types::*;
use crate::daemon::ShutdownSignal;
use crate::endpoint::{EndpointMonitor, EndpointState, EndpointStatus};
use crate::sink::QueueSink;
use crate::socket::{SocketError, SocketPath};

/// Mode of the control socket: owner only.
pub const CONTROL_SOCKET_MODE: u32 = 0o600;

/// What the route handlers can see of the running daemon.
pub struct IpcState {
    pub config: AppConfig,
    pub shutdown_tx: broadcast::Sender<ShutdownSignal>,
    pub monitors: Vec<Arc<EndpointMonitor>>,
    pub queue: QueueSink,
    pub started_at: Instant,
}

impl IpcState {
    fn statuses(&self) -> Vec<EndpointStatus> {
        self.monitors.iter().map(|m| m.status()).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpcServerError {
    #[error("control socket: {0}")]
    Socket(#[from] SocketError),

    #[error("control server I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A failed request, rendered as an [`ErrorResponse`] body.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

pub fn router(state: Arc<IpcState>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/endpoints", get(get_endpoints))
        .route("/config", get(get_config))
        .route("/stop", post(post_stop))
        .fallback(unknown_route)
        .with_state(state)
}

/// Serve the control API on `socket_path` until a shutdown signal arrives,
/// then unlink the socket.
pub async fn serve(
    socket_path: &Path,
    state: Arc<IpcState>,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) -> Result<(), IpcServerError> {
    let claim = SocketPath::claim(socket_path)?;
    let listener = claim.bind_listener()?;
    claim.set_mode(CONTROL_SOCKET_MODE)?;
    let listener = UnixListener::from_std(listener)?;
    info!(
        path = %socket_path.display(),
        mode = format_args!("{CONTROL_SOCKET_MODE:o}"),
        "Control socket listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            debug!("Control socket draining");
        })
        .await?;

    claim.release()?;
    info!(path = %socket_path.display(), "Control socket closed");
    Ok(())
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse::current())
}

async fn get_status(State(state): State<Arc<IpcState>>) -> Json<StatusResponse> {
    let endpoints = state.statuses();
    let endpoints_failed = endpoints
        .iter()
        .filter(|s| s.state == EndpointState::Failed)
        .count();

    Json(StatusResponse {
        running: true,
        version: crate::build_info::VERSION.to_string(),
        git_hash: crate::build_info::GIT_HASH.to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        pid: std::process::id(),
        log_level: state.config.logging.level.clone(),
        queue_capacity: state.queue.capacity(),
        queue_available: state.queue.available(),
        endpoints_failed,
        endpoints,
    })
}

async fn get_endpoints(State(state): State<Arc<IpcState>>) -> Json<EndpointsResponse> {
    Json(EndpointsResponse {
        endpoints: state.statuses(),
    })
}

async fn get_config(
    State(state): State<Arc<IpcState>>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let toml = toml::to_string_pretty(&state.config).map_err(|e| {
        ApiError(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("cannot render configuration: {e}"),
        )
    })?;
    Ok(Json(ConfigResponse { toml }))
}

async fn post_stop(State(state): State<Arc<IpcState>>) -> Json<StopResponse> {
    // No receivers means the daemon is already on its way out.
    let acknowledged = state.shutdown_tx.send(ShutdownSignal).is_ok();
    info!(acknowledged, "Stop requested over control socket");
    let message = if acknowledged {
        "eventgate is shutting down"
    } else {
        "eventgate is already shutting down"
    };
    Json(StopResponse {
        acknowledged,
        message: message.to_string(),
    })
}

async fn unknown_route(uri: Uri) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("no such route: {}", uri.path()))
}
