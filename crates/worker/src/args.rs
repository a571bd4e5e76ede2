//! Worker start-up arguments (the manager's spawn contract).
//!
//! Positional: `[workerId, maxRequestsPerWorker, appBaseDir, appEntryPath, appName]`.
//! Environment: `WORKER_ID`, `APP_NAME`, `SOCKET_PATH`, `SOCKET_PREFIX`,
//! `RIP_VARIANT`, `RIP_LOG_JSON`, `RIP_HOT_RELOAD`, `RIP_CONTROL_SOCKET`.

use crate::error::{Result, WorkerError};
use crate::server::WorkerConfig;
use common::format::socket_path;
use common::wire::{HotReload, env};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerArgs {
    pub id: usize,
    pub max_requests: u64,
    pub app_dir: PathBuf,
    pub entry: Option<PathBuf>,
    pub app_name: String,
    pub socket_path: PathBuf,
    pub socket_prefix: Option<String>,
    pub variant: Option<String>,
    pub log_json: bool,
    pub hot_reload: HotReload,
    pub control_socket: Option<PathBuf>,
}

impl WorkerArgs {
    /// Read from the process arguments and environment.
    pub fn from_env() -> Result<Self> {
        Self::from_sources(std::env::args().skip(1), |key| std::env::var(key).ok())
    }

    /// Build from explicit positional arguments and an environment lookup.
    pub fn from_sources<I, F>(args: I, lookup: F) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
        F: Fn(&str) -> Option<String>,
    {
        let mut args = args.into_iter();
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        let id = non_empty(args.next())
            .or_else(|| non_empty(lookup(env::WORKER_ID)))
            .ok_or_else(|| WorkerError::args("missing worker id"))?;
        let id: usize = id
            .parse()
            .map_err(|_| WorkerError::args(format!("invalid worker id '{}'", id)))?;

        let max_requests = match non_empty(args.next()) {
            Some(v) => v
                .parse()
                .map_err(|_| WorkerError::args(format!("invalid max requests '{}'", v)))?,
            None => 0,
        };

        let app_dir = non_empty(args.next())
            .map(PathBuf::from)
            .ok_or_else(|| WorkerError::args("missing app directory"))?;
        let entry = non_empty(args.next()).map(PathBuf::from);

        let app_name = non_empty(args.next())
            .or_else(|| non_empty(lookup(env::APP_NAME)))
            .or_else(|| {
                app_dir
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "app".to_string());

        let socket_prefix = non_empty(lookup(env::SOCKET_PREFIX));
        let socket_path = match (non_empty(lookup(env::SOCKET_PATH)), &socket_prefix) {
            (Some(path), _) => PathBuf::from(path),
            (None, Some(prefix)) => socket_path(std::env::temp_dir(), prefix, id),
            (None, None) => {
                return Err(WorkerError::args(format!(
                    "{} or {} must be set",
                    env::SOCKET_PATH,
                    env::SOCKET_PREFIX
                )));
            }
        };

        let hot_reload = match non_empty(lookup(env::HOT_RELOAD)) {
            Some(v) => v.parse().map_err(WorkerError::args)?,
            None => HotReload::None,
        };

        Ok(Self {
            id,
            max_requests,
            app_dir,
            entry,
            app_name,
            socket_path,
            socket_prefix,
            variant: non_empty(lookup(env::VARIANT)),
            log_json: lookup(env::LOG_JSON).as_deref() == Some("1"),
            hot_reload,
            control_socket: non_empty(lookup(env::CONTROL_SOCKET)).map(PathBuf::from),
        })
    }

    /// Server settings derived from these arguments.
    pub fn to_config(&self) -> WorkerConfig {
        WorkerConfig {
            id: self.id,
            app_name: self.app_name.clone(),
            socket_path: self.socket_path.clone(),
            max_requests: self.max_requests,
            control_socket: self.control_socket.clone(),
        }
    }
}
