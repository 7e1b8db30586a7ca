//! JSON bodies exchanged on the control socket.

use serde::{Deserialize, Serialize};

use crate::build_info;
use crate::endpoint::EndpointStatus;

/// `GET /health`: liveness plus the build that is answering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
    pub target: String,
    /// Unix seconds at compile time.
    pub built_at: String,
}

impl HealthResponse {
    pub fn current() -> Self {
        Self {
            status: "ok".to_string(),
            version: build_info::VERSION.to_string(),
            git_hash: build_info::GIT_HASH.to_string(),
            build_profile: build_info::BUILD_PROFILE.to_string(),
            target: build_info::TARGET.to_string(),
            built_at: build_info::BUILD_TIMESTAMP.to_string(),
        }
    }
}

/// `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub version: String,
    pub git_hash: String,
    pub uptime_secs: u64,
    pub pid: u32,
    pub log_level: String,
    pub queue_capacity: usize,
    /// Free slots in the event queue when the request was answered.
    pub queue_available: usize,
    pub endpoints_failed: usize,
    pub endpoints: Vec<EndpointStatus>,
}

/// `GET /endpoints`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsResponse {
    pub endpoints: Vec<EndpointStatus>,
}

/// `POST /stop`. `acknowledged` is false when nothing was left to signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub acknowledged: bool,
    pub message: String,
}

/// `GET /config`: the running configuration rendered as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub toml: String,
}

/// Body of every non-2xx reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
