//! Common utilities and types shared across the rip-server components.
//!
//! - [`format`]: timestamps, readable durations, access-log lines and
//!   socket path derivation
//! - [`wire`]: the manager/worker/balancer contract (headers, env vars,
//!   control messages, status snapshot)
//! - [`pidfile`]: PID/metadata records consumed by `status`/`stop` tooling

pub mod error;
pub mod format;
pub mod logging;
pub mod pidfile;
pub mod wire;

pub use error::{Error, Result};
