//! Worker process for the rip application server.
//!
//! A worker hosts one application handler behind a Unix-domain HTTP
//! listener and serves at most one request at a time. It answers
//! readiness probes, signals "busy" to the load balancer when it is
//! already occupied, retires after a bounded number of requests and
//! shuts down gracefully on SIGTERM/SIGINT.
//!
//! # Components
//!
//! - **Handler**: the loaded application, a function or a service object
//! - **Loader**: entry resolution and the CGI-style executable app
//! - **Server**: socket listener enforcing single-inflight and lifetime
//! - **Registration**: best-effort control-socket announcements

pub mod args;
pub mod error;
pub mod handler;
pub mod loader;
pub mod registration;
pub mod server;
pub mod signal;

pub use args::WorkerArgs;
pub use error::{Result, WorkerError};
pub use handler::{AppService, FixedProvider, Handler, HandlerProvider};
pub use loader::{ExecApp, LoaderProvider, resolve_entry};
pub use registration::ControlClient;
pub use server::{Worker, WorkerConfig};
