//! rip application server: configuration, application lifecycle and the
//! platform controller.
//!
//! An application is a pool of worker processes (see the `manager` crate)
//! behind one HTTP load balancer (see the `balancer` crate). [`AppServer`]
//! starts one such pair; [`Platform`] keeps a registry of named
//! applications and exposes them through a REST API.

pub mod app;
pub mod config;
pub mod platform;

pub use app::{AppError, AppServer};
pub use config::{AppLaunch, Config, ConfigError};
pub use platform::{AppConfig, AppStatus, Platform, PlatformError};
