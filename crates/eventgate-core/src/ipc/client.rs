//! IPC client for the daemon's control socket.
//!
//! One HTTP/1.1 connection per call, driven by `hyper` directly over a
//! tokio `UnixStream`. Used by the CLI and by tests.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use super::types::*;

/// Errors from talking to the control socket.
#[derive(Debug, thiserror::Error)]
pub enum IpcClientError {
    #[error("eventgate is not running (no control socket at {0})")]
    NotRunning(PathBuf),

    #[error("cannot connect to control socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid control request: {0}")]
    Build(#[from] hyper::http::Error),

    #[error("daemon answered {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("unexpected reply to {route}: {source}")]
    Decode {
        route: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Typed client for the daemon's control API.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the control socket file exists. A leftover socket from a
    /// crashed daemon also counts; the first request tells them apart.
    pub fn socket_present(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn health(&self) -> Result<HealthResponse, IpcClientError> {
        self.call(Method::GET, "/health").await
    }

    /// Daemon summary plus every endpoint's state and counters.
    pub async fn status(&self) -> Result<StatusResponse, IpcClientError> {
        self.call(Method::GET, "/status").await
    }

    pub async fn endpoints(&self) -> Result<EndpointsResponse, IpcClientError> {
        self.call(Method::GET, "/endpoints").await
    }

    /// The configuration the daemon is running with, as TOML.
    pub async fn config(&self) -> Result<ConfigResponse, IpcClientError> {
        self.call(Method::GET, "/config").await
    }

    /// Ask the daemon to close its endpoints and exit.
    pub async fn stop(&self) -> Result<StopResponse, IpcClientError> {
        self.call(Method::POST, "/stop").await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        route: &'static str,
    ) -> Result<T, IpcClientError> {
        let (status, body) = self.send(method, route).await?;
        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            return Err(IpcClientError::Status { status, message });
        }
        serde_json::from_slice(&body).map_err(|source| IpcClientError::Decode { route, source })
    }

    async fn send(
        &self,
        method: Method,
        route: &'static str,
    ) -> Result<(StatusCode, Bytes), IpcClientError> {
        if !self.socket_present() {
            return Err(IpcClientError::NotRunning(self.socket_path.clone()));
        }
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| IpcClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake::<_, Full<Bytes>>(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "Control connection ended with an error");
            }
        });

        debug!(%method, route, "Control request");
        let request = Request::builder()
            .method(method)
            .uri(route)
            .header(hyper::header::HOST, "eventgate")
            .body(Full::new(Bytes::new()))?;
        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}
