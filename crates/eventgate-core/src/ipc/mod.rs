//! Daemon IPC over a Unix domain socket, used by the CLI.
//!
//! The reactor thread publishes endpoint state through shared monitors;
//! the control server reads them on the tokio side and answers HTTP/1.1
//! requests with JSON bodies from [`types`]. [`IpcClient`] is the other
//! end of the socket.
//!
//! | Route            | Reply                 |
//! |------------------|-----------------------|
//! | `GET /health`    | [`HealthResponse`]    |
//! | `GET /status`    | [`StatusResponse`]    |
//! | `GET /endpoints` | [`EndpointsResponse`] |
//! | `GET /config`    | [`ConfigResponse`]    |
//! | `POST /stop`     | [`StopResponse`]      |

pub mod client;
pub mod server;
pub mod types;

pub use client::{IpcClient, IpcClientError};
pub use server::{ApiError, IpcServerError, IpcState};
pub use types::*;
