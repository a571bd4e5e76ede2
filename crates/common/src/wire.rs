//! Contract shared by the manager, workers and the load balancer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Busy sentinel set by a worker that already has a request in flight.
pub const WORKER_BUSY_HEADER: &str = "rip-worker-busy";

/// Worker-measured handling time in milliseconds.
pub const WORKER_TIME_HEADER: &str = "rip-worker-ms";

/// Worker identity, kept on client responses.
pub const WORKER_ID_HEADER: &str = "x-rip-worker";

/// Headers that never leave the load balancer.
pub const INTERNAL_HEADERS: [&str; 2] = [WORKER_BUSY_HEADER, WORKER_TIME_HEADER];

/// Readiness probe path answered by every worker.
pub const READY_PATH: &str = "/ready";

/// Health snapshot path answered by the load balancer.
pub const STATUS_PATH: &str = "/status";

/// Path on the control socket that accepts [`ControlMessage`]s.
pub const CONTROL_PATH: &str = "/register";

/// Environment variables of the spawn contract.
pub mod env {
    pub const WORKER_ID: &str = "WORKER_ID";
    pub const APP_NAME: &str = "APP_NAME";
    pub const SOCKET_PATH: &str = "SOCKET_PATH";
    pub const SOCKET_PREFIX: &str = "SOCKET_PREFIX";
    pub const VARIANT: &str = "RIP_VARIANT";
    pub const LOG_JSON: &str = "RIP_LOG_JSON";
    pub const HOT_RELOAD: &str = "RIP_HOT_RELOAD";
    pub const CONTROL_SOCKET: &str = "RIP_CONTROL_SOCKET";
}

/// Hot reload strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotReload {
    /// No reloading
    #[default]
    None,
    /// The manager restarts workers when app files change
    Process,
    /// Workers reload the handler when its file changes
    Module,
}

impl HotReload {
    pub fn as_str(&self) -> &'static str {
        match self {
            HotReload::None => "none",
            HotReload::Process => "process",
            HotReload::Module => "module",
        }
    }
}

impl fmt::Display for HotReload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HotReload {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(HotReload::None),
            "process" => Ok(HotReload::Process),
            "module" => Ok(HotReload::Module),
            other => Err(crate::Error::invalid_value(format!(
                "unknown hot reload mode '{}'",
                other
            ))),
        }
    }
}

/// Message a worker sends to the control socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ControlMessage {
    Register {
        app: String,
        #[serde(rename = "workerId")]
        worker_id: usize,
        pid: u32,
        socket: String,
    },
    Deregister {
        app: String,
        #[serde(rename = "workerId")]
        worker_id: usize,
        socket: String,
    },
}

impl ControlMessage {
    pub fn socket(&self) -> &str {
        match self {
            ControlMessage::Register { socket, .. } | ControlMessage::Deregister { socket, .. } => {
                socket
            }
        }
    }

    pub fn app(&self) -> &str {
        match self {
            ControlMessage::Register { app, .. } | ControlMessage::Deregister { app, .. } => app,
        }
    }
}

/// Pool health as reported on `/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
}

/// Listening ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ports {
    pub http: u16,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub status: Health,
    pub app: String,
    pub workers: usize,
    pub ready: usize,
    pub ports: Ports,
    /// Seconds since the load balancer started
    pub uptime: f64,
}
