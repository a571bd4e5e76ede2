//! Load balancer for rip worker pools.
//!
//! The balancer is the HTTP front door of one application. It tracks the
//! pool's worker sockets, forwards each request to an idle ready worker,
//! retries elsewhere when a worker reports itself busy or fails, and queues
//! requests when every worker is occupied.
//!
//! # Components
//!
//! - **Upstreams**: the socket table and round-robin selection
//! - **Client**: one HTTP/1.1 exchange per request over a Unix socket
//! - **Server**: admission, queueing, forwarding and the `/status` snapshot
//! - **Probe** / **Discovery**: background readiness checks and socket tracking
//! - **Metrics**: Prometheus registry and its HTTP endpoint

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod http_server;
pub mod metrics;
pub mod probe;
pub mod server;
pub mod upstream;

pub use client::{ClientError, UnixClient, UpstreamReply};
pub use config::{AccessLogFormat, BalancerConfig, DiscoveryMode};
pub use error::{BalancerError, Result};
pub use http_server::MetricsServer;
pub use metrics::MetricsRegistry;
pub use server::{BalancerStats, LoadBalancer};
pub use upstream::{UpstreamSet, UpstreamState};
