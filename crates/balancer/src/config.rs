//! Load balancer runtime settings.

use common::format::socket_prefix;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How worker sockets are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Periodic scan of the socket directory
    #[default]
    Scan,
    /// Workers register through the control socket
    Control,
}

/// Access log rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogFormat {
    #[default]
    Human,
    Json,
    Off,
}

/// Load balancer settings
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Application name reported on `/status`
    pub app_name: String,

    /// Public HTTP port reported on `/status`
    pub http_port: u16,

    /// Directory holding the worker sockets
    pub socket_dir: PathBuf,

    /// Worker socket prefix
    pub socket_prefix: String,

    pub discovery: DiscoveryMode,

    /// Control socket path (control discovery)
    pub control_socket: PathBuf,

    /// Upstream connect timeout; expiry quarantines the socket
    pub connect_timeout: Duration,

    /// Upstream read timeout; expiry answers 504
    pub read_timeout: Duration,

    /// Longest a request may wait in the queue
    pub queue_timeout: Duration,

    /// Queue depth limit
    pub max_queue: usize,

    /// Cool-down after a failed forwarding attempt
    pub quarantine: Duration,

    pub probe_interval: Duration,
    pub scan_interval: Duration,
    pub drain_interval: Duration,

    /// Largest accepted request body
    pub max_body_bytes: usize,

    pub access_log: AccessLogFormat,
}

impl BalancerConfig {
    /// Defaults for application `app_name` served on `http_port`.
    pub fn new(app_name: impl Into<String>, http_port: u16) -> Self {
        let app_name = app_name.into();
        let socket_prefix = socket_prefix(&app_name);
        let socket_dir = std::env::temp_dir();
        Self {
            control_socket: socket_dir.join(format!("{}-control.sock", socket_prefix)),
            app_name,
            http_port,
            socket_dir,
            socket_prefix,
            discovery: DiscoveryMode::Scan,
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(5),
            max_queue: 1000,
            quarantine: Duration::from_secs(1),
            probe_interval: Duration::from_millis(500),
            scan_interval: Duration::from_millis(250),
            drain_interval: Duration::from_millis(10),
            max_body_bytes: 16 * 1024 * 1024,
            access_log: AccessLogFormat::Human,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BalancerConfig::new("blog", 3000);
        assert_eq!(config.socket_prefix, "rip-blog");
        assert_eq!(config.discovery, DiscoveryMode::Scan);
        assert_eq!(
            config.control_socket,
            std::env::temp_dir().join("rip-blog-control.sock")
        );
        assert!(config.connect_timeout < config.read_timeout);
    }

    #[test]
    fn test_mode_names() {
        let mode: DiscoveryMode = serde_json::from_str("\"control\"").unwrap();
        assert_eq!(mode, DiscoveryMode::Control);
        let format: AccessLogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, AccessLogFormat::Json);
    }
}
