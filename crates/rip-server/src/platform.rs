//! Platform controller: named applications, each driving its own
//! Manager + LoadBalancer pair, plus the REST API over them.

use crate::app::{AppError, AppServer};
use crate::config::{AppLaunch, Config};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use balancer::BalancerStats;
use common::format::socket_prefix;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use validator::{Validate, ValidationError};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Application '{0}' not found")]
    NotFound(String),

    #[error("Application '{0}' already exists")]
    AlreadyExists(String),

    #[error("Port {port} is already used by '{app}'")]
    PortInUse { port: u16, app: String },

    #[error("Application '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Application '{0}' is not running")]
    NotRunning(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to start '{name}': {source}")]
    Start {
        name: String,
        #[source]
        source: AppError,
    },

    #[error("Failed to restart '{name}': {source}")]
    Restart {
        name: String,
        #[source]
        source: AppError,
    },
}

impl PlatformError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PlatformError::NotFound(_) => StatusCode::NOT_FOUND,
            PlatformError::AlreadyExists(_)
            | PlatformError::PortInUse { .. }
            | PlatformError::AlreadyRunning(_)
            | PlatformError::NotRunning(_) => StatusCode::CONFLICT,
            PlatformError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PlatformError::Start { .. } | PlatformError::Restart { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<validator::ValidationErrors> for PlatformError {
    fn from(errors: validator::ValidationErrors) -> Self {
        PlatformError::InvalidRequest(errors.to_string())
    }
}

impl From<JsonRejection> for PlatformError {
    fn from(rejection: JsonRejection) -> Self {
        PlatformError::InvalidRequest(rejection.body_text())
    }
}

impl IntoResponse for PlatformError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Platform request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Deployed,
    Running,
    Stopped,
    Error,
}

/// Registry entry for one named application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub directory: PathBuf,
    pub port: u16,
    pub workers: usize,
    pub status: AppStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /api/apps`
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeployRequest {
    #[validate(length(min = 1, max = 64), custom = "validate_app_name")]
    pub name: String,

    pub directory: PathBuf,

    /// 0 picks a free port at start
    pub port: u16,

    #[validate(range(min = 1, max = 256))]
    pub workers: Option<usize>,
}

/// Body of `POST /api/apps/:name/scale`
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ScaleRequest {
    #[validate(range(min = 1, max = 256))]
    pub workers: usize,
}

fn validate_app_name(name: &str) -> std::result::Result<(), ValidationError> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid || name.starts_with('.') {
        return Err(ValidationError::new("invalid_app_name"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub id: usize,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub uptime_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStats {
    pub name: String,
    pub status: AppStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balancer: Option<BalancerStats>,
    pub workers: Vec<WorkerView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformStats {
    pub apps: usize,
    pub running: usize,
    pub requests: u64,
    pub inflight: usize,
    pub queued: usize,
    pub workers: usize,
    pub by_app: Vec<AppStats>,
}

struct Entry {
    config: AppConfig,
    server: Option<AppServer>,
}

/// Registry of deployed applications
pub struct Platform {
    base: Config,
    apps: DashMap<String, Arc<Mutex<Entry>>>,
}

impl Platform {
    /// `base` supplies pool, balancer and manager settings for every app.
    pub fn new(mut base: Config) -> Self {
        // One metrics listen address cannot serve several apps
        base.metrics.enabled = false;
        // Nor can one control socket; each app derives its own
        base.balancer.control_socket = None;
        Self {
            base,
            apps: DashMap::new(),
        }
    }

    fn entry(&self, name: &str) -> Result<Arc<Mutex<Entry>>> {
        self.apps
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))
    }

    /// Entries cloned out so no map guard is held across an await.
    fn entries(&self) -> Vec<Arc<Mutex<Entry>>> {
        self.apps.iter().map(|e| e.value().clone()).collect()
    }

    fn launch(&self, config: &AppConfig) -> AppLaunch {
        AppLaunch {
            name: config.name.clone(),
            dir: config.directory.clone(),
            port: config.port,
            workers: config.workers,
            max_requests: self.base.pool.max_requests,
        }
    }

    /// Register an application without starting it.
    pub async fn deploy(&self, request: DeployRequest) -> Result<AppConfig> {
        request.validate()?;
        if !request.directory.is_dir() {
            return Err(PlatformError::InvalidRequest(format!(
                "directory {} does not exist",
                request.directory.display()
            )));
        }

        // Names that sanitize alike would share worker sockets
        let prefix = socket_prefix(&request.name);
        for entry in self.entries() {
            let other = entry.lock().await;
            if request.port != 0 && other.config.port == request.port {
                return Err(PlatformError::PortInUse {
                    port: request.port,
                    app: other.config.name.clone(),
                });
            }
            if other.config.name != request.name && socket_prefix(&other.config.name) == prefix {
                return Err(PlatformError::InvalidRequest(format!(
                    "name {} clashes with application {}",
                    request.name, other.config.name
                )));
            }
        }

        let config = AppConfig {
            name: request.name.clone(),
            directory: request.directory,
            port: request.port,
            workers: request.workers.unwrap_or(self.base.pool.workers),
            status: AppStatus::Deployed,
            started_at: None,
            error: None,
        };

        match self.apps.entry(request.name) {
            MapEntry::Occupied(occupied) => {
                Err(PlatformError::AlreadyExists(occupied.key().clone()))
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(Entry {
                    config: config.clone(),
                    server: None,
                })));
                info!(app = %config.name, port = config.port, "Application deployed");
                Ok(config)
            }
        }
    }

    /// Start the app's Manager + LoadBalancer pair.
    pub async fn start(&self, name: &str) -> Result<AppConfig> {
        let entry = self.entry(name)?;
        let mut entry = entry.lock().await;
        if entry.server.is_some() {
            return Err(PlatformError::AlreadyRunning(name.to_string()));
        }
        self.start_locked(&mut entry).await?;
        Ok(entry.config.clone())
    }

    async fn start_locked(&self, entry: &mut Entry) -> Result<()> {
        let launch = self.launch(&entry.config);
        match AppServer::start(&self.base, launch).await {
            Ok(server) => {
                if entry.config.port == 0 {
                    entry.config.port = server.local_addr().port();
                }
                entry.config.status = AppStatus::Running;
                entry.config.started_at = Some(chrono::Local::now().to_rfc3339());
                entry.config.error = None;
                entry.server = Some(server);
                Ok(())
            }
            Err(source) => {
                entry.config.status = AppStatus::Error;
                entry.config.started_at = None;
                entry.config.error = Some(source.to_string());
                Err(PlatformError::Start {
                    name: entry.config.name.clone(),
                    source,
                })
            }
        }
    }

    /// Stop the app; stopping a stopped app is a no-op.
    pub async fn stop(&self, name: &str) -> Result<AppConfig> {
        let entry = self.entry(name)?;
        let mut entry = entry.lock().await;
        if let Some(server) = entry.server.take() {
            server.stop().await;
            entry.config.status = AppStatus::Stopped;
            entry.config.started_at = None;
        }
        Ok(entry.config.clone())
    }

    /// Change the worker count, restarting the pair if it is running.
    pub async fn scale(&self, name: &str, request: ScaleRequest) -> Result<AppConfig> {
        request.validate()?;
        let entry = self.entry(name)?;
        let mut entry = entry.lock().await;
        entry.config.workers = request.workers;
        info!(app = name, workers = request.workers, "Scaling application");
        if let Some(server) = entry.server.take() {
            server.stop().await;
            self.start_locked(&mut entry).await?;
        }
        Ok(entry.config.clone())
    }

    /// Rolling restart of a running app's workers.
    pub async fn restart(&self, name: &str) -> Result<AppConfig> {
        let entry = self.entry(name)?;
        let entry = entry.lock().await;
        let Some(server) = &entry.server else {
            return Err(PlatformError::NotRunning(name.to_string()));
        };
        server.restart().await.map_err(|source| PlatformError::Restart {
            name: name.to_string(),
            source,
        })?;
        Ok(entry.config.clone())
    }

    /// Stop and forget the app.
    pub async fn undeploy(&self, name: &str) -> Result<AppConfig> {
        let Some((_, entry)) = self.apps.remove(name) else {
            return Err(PlatformError::NotFound(name.to_string()));
        };
        let mut entry = entry.lock().await;
        if let Some(server) = entry.server.take() {
            server.stop().await;
        }
        info!(app = name, "Application undeployed");
        Ok(entry.config.clone())
    }

    /// Registry snapshot ordered by name.
    pub async fn apps(&self) -> Vec<AppConfig> {
        let entries = self.entries();
        let mut apps = Vec::with_capacity(entries.len());
        for entry in entries {
            apps.push(entry.lock().await.config.clone());
        }
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        apps
    }

    /// Aggregate counters over every app.
    pub async fn stats(&self) -> PlatformStats {
        let entries = self.entries();
        let mut by_app = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.lock().await;
            let (balancer, workers) = match &entry.server {
                Some(server) => (
                    Some(server.stats()),
                    server
                        .workers()
                        .into_iter()
                        .map(|w| WorkerView {
                            id: w.id,
                            pid: w.pid,
                            restart_count: w.restart_count,
                            uptime_secs: w.uptime.as_secs_f64(),
                        })
                        .collect(),
                ),
                None => (None, Vec::new()),
            };
            by_app.push(AppStats {
                name: entry.config.name.clone(),
                status: entry.config.status,
                balancer,
                workers,
            });
        }
        by_app.sort_by(|a, b| a.name.cmp(&b.name));

        let running = by_app.iter().filter(|a| a.status == AppStatus::Running).count();
        let totals = by_app.iter().filter_map(|a| a.balancer.as_ref());
        let (requests, inflight, queued) = totals.fold((0, 0, 0), |(r, i, q), s| {
            (r + s.requests, i + s.inflight, q + s.queued)
        });
        PlatformStats {
            apps: by_app.len(),
            running,
            requests,
            inflight,
            queued,
            workers: by_app.iter().map(|a| a.workers.len()).sum(),
            by_app,
        }
    }

    /// Stop every running app.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.apps.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(app = %name, error = %e, "Failed to stop application");
            }
        }
    }

    /// REST API router
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/api/apps", get(list_apps).post(deploy_app))
            .route("/api/stats", get(platform_stats))
            .route("/api/apps/:name", delete(undeploy_app))
            .route("/api/apps/:name/start", post(start_app))
            .route("/api/apps/:name/stop", post(stop_app))
            .route("/api/apps/:name/scale", post(scale_app))
            .route("/api/apps/:name/restart", post(restart_app))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    /// Serve the REST API until `shutdown`, then stop every app.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "Platform controller listening");
        let token = shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        self.stop_all().await;
        info!("Platform controller stopped");
        served
    }
}

type Shared = State<Arc<Platform>>;

async fn list_apps(State(platform): Shared) -> Json<Vec<AppConfig>> {
    Json(platform.apps().await)
}

async fn platform_stats(State(platform): Shared) -> Json<PlatformStats> {
    Json(platform.stats().await)
}

async fn deploy_app(
    State(platform): Shared,
    body: std::result::Result<Json<DeployRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AppConfig>)> {
    let Json(request) = body?;
    let config = platform.deploy(request).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn undeploy_app(State(platform): Shared, Path(name): Path<String>) -> Result<Json<AppConfig>> {
    Ok(Json(platform.undeploy(&name).await?))
}

async fn start_app(State(platform): Shared, Path(name): Path<String>) -> Result<Json<AppConfig>> {
    Ok(Json(platform.start(&name).await?))
}

async fn stop_app(State(platform): Shared, Path(name): Path<String>) -> Result<Json<AppConfig>> {
    Ok(Json(platform.stop(&name).await?))
}

async fn scale_app(
    State(platform): Shared,
    Path(name): Path<String>,
    body: std::result::Result<Json<ScaleRequest>, JsonRejection>,
) -> Result<Json<AppConfig>> {
    let Json(request) = body?;
    Ok(Json(platform.scale(&name, request).await?))
}

async fn restart_app(State(platform): Shared, Path(name): Path<String>) -> Result<Json<AppConfig>> {
    Ok(Json(platform.restart(&name).await?))
}
