//! Configuration loading and validation for rip-server

use balancer::{AccessLogFormat, BalancerConfig, DiscoveryMode};
use common::format::socket_prefix;
use common::wire::HotReload;
use manager::{ManagerConfig, RestartPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub balancer: BalancerSettings,

    #[serde(default)]
    pub manager: ManagerSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub platform: PlatformSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.server.validate()?;
        self.pool.validate()?;
        self.balancer.validate()?;
        self.manager.validate()?;
        Ok(())
    }
}

/// Server-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    /// Application name; defaults to the app directory name
    pub app_name: Option<String>,

    #[validate(length(min = 1))]
    pub host: String,

    #[validate(range(min = 1))]
    pub http_port: u16,

    /// Directory for PID records
    pub run_dir: PathBuf,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PoolSettings {
    #[validate(range(min = 1, max = 256))]
    pub workers: usize,

    /// Requests per worker before it is recycled (0 = unlimited)
    pub max_requests: u64,

    #[validate(custom = "validate_socket_dir")]
    pub socket_dir: PathBuf,

    /// Worker executable; defaults to `rip-worker` next to this binary
    pub worker_program: Option<PathBuf>,

    /// Explicit app entry file
    pub entry: Option<PathBuf>,

    pub hot_reload: HotReload,
    pub variant: Option<String>,
}

/// Load balancer settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BalancerSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_connect_timeout")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_long_timeout")]
    pub read_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_long_timeout")]
    pub queue_timeout: Duration,

    #[validate(range(max = 100000))]
    pub max_queue: usize,

    #[serde(with = "humantime_serde")]
    pub quarantine: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_interval")]
    pub probe_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_interval")]
    pub scan_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_interval")]
    pub drain_interval: Duration,

    #[validate(range(min = 1))]
    pub max_body_bytes: usize,

    pub discovery: DiscoveryMode,

    /// Control socket path for `control` discovery
    pub control_socket: Option<PathBuf>,

    pub access_log: AccessLogFormat,
}

/// Manager-specific settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ManagerSettings {
    #[serde(with = "humantime_serde")]
    pub restart_base: Duration,

    #[serde(with = "humantime_serde")]
    pub restart_max: Duration,

    #[validate(range(min = 1, max = 1000))]
    pub max_restarts: u32,

    #[serde(with = "humantime_serde")]
    pub stable_after: Duration,

    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_interval")]
    pub watch_debounce: Duration,
}

/// Prometheus endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen_addr: String,
}

/// Platform controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub port: u16,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl LoggingSettings {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            app_name: None,
            host: "0.0.0.0".to_string(),
            http_port: 3000,
            run_dir: default_run_dir(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            max_requests: 10_000,
            socket_dir: std::env::temp_dir(),
            worker_program: None,
            entry: None,
            hot_reload: HotReload::None,
            variant: None,
        }
    }
}

impl Default for BalancerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(5),
            max_queue: 1000,
            quarantine: Duration::from_secs(1),
            probe_interval: Duration::from_millis(500),
            scan_interval: Duration::from_millis(250),
            drain_interval: Duration::from_millis(10),
            max_body_bytes: 16 * 1024 * 1024,
            discovery: DiscoveryMode::Scan,
            control_socket: None,
            access_log: AccessLogFormat::Human,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        let restart = RestartPolicy::default();
        Self {
            restart_base: restart.base,
            restart_max: restart.max,
            max_restarts: restart.max_restarts,
            stable_after: restart.stable_after,
            kill_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            watch_debounce: Duration::from_millis(150),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self { port: 3100 }
    }
}

fn default_run_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".rip/run"))
        .unwrap_or_else(|| std::env::temp_dir().join("rip/run"))
}

// Custom validators

fn validate_socket_dir(dir: &PathBuf) -> Result<(), ValidationError> {
    if dir.as_os_str().is_empty() {
        return Err(ValidationError::new("socket_dir_empty"));
    }
    // Unix socket paths are limited to ~104 bytes; leave room for file names
    if dir.as_os_str().len() > 80 {
        return Err(ValidationError::new("socket_dir_too_long"));
    }
    Ok(())
}

fn validate_connect_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if millis < 1 || millis > 10_000 {
        return Err(ValidationError::new("connect_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_long_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if millis < 1 || millis > 3_600_000 {
        return Err(ValidationError::new("timeout_out_of_range"));
    }
    Ok(())
}

fn validate_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if millis < 1 || millis > 60_000 {
        return Err(ValidationError::new("interval_out_of_range"));
    }
    Ok(())
}

/// One application to run: what the CLI or the platform asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct AppLaunch {
    pub name: String,
    pub dir: PathBuf,
    pub port: u16,
    pub workers: usize,
    pub max_requests: u64,
}

// Configuration loading implementation

impl Config {
    /// Load configuration from an explicit file or the default search paths
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            return Self::load_from_file(path);
        }

        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/rip/rip-server.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./rip-server.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/rip/rip-server.yaml"))
    }

    /// Launch request for the app in `dir` using the configured pool size.
    pub fn launch(&self, dir: impl Into<PathBuf>) -> AppLaunch {
        let dir = dir.into();
        let name = self.server.app_name.clone().unwrap_or_else(|| {
            dir.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "app".to_string())
        });
        AppLaunch {
            name,
            dir,
            port: self.server.http_port,
            workers: self.pool.workers,
            max_requests: self.pool.max_requests,
        }
    }

    /// Worker executable: configured, else `rip-worker` beside the current binary.
    pub fn worker_program(&self) -> PathBuf {
        if let Some(program) = &self.pool.worker_program {
            return program.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("rip-worker")))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from("rip-worker"))
    }

    fn control_socket(&self, prefix: &str) -> PathBuf {
        self.balancer
            .control_socket
            .clone()
            .unwrap_or_else(|| self.pool.socket_dir.join(format!("{}-control.sock", prefix)))
    }

    /// Manager settings for `app`.
    pub fn manager_config(&self, app: &AppLaunch) -> ManagerConfig {
        let prefix = socket_prefix(&app.name);
        let mut config = ManagerConfig::new(&app.name, &app.dir, self.worker_program());
        config.entry = self.pool.entry.clone();
        config.workers = app.workers;
        config.max_requests = app.max_requests;
        config.socket_dir = self.pool.socket_dir.clone();
        config.hot_reload = self.pool.hot_reload;
        config.log_json = self.logging.json();
        config.variant = self.pool.variant.clone();
        if self.balancer.discovery == DiscoveryMode::Control {
            config.control_socket = Some(self.control_socket(&prefix));
        }
        config.socket_prefix = prefix;
        config.restart = RestartPolicy {
            base: self.manager.restart_base,
            max: self.manager.restart_max,
            max_restarts: self.manager.max_restarts,
            stable_after: self.manager.stable_after,
        };
        config.kill_timeout = self.manager.kill_timeout;
        config.ready_timeout = self.manager.ready_timeout;
        config
    }

    /// Load balancer settings for `app`.
    pub fn balancer_config(&self, app: &AppLaunch) -> BalancerConfig {
        let mut config = BalancerConfig::new(&app.name, app.port);
        let settings = &self.balancer;
        config.socket_dir = self.pool.socket_dir.clone();
        config.control_socket = self.control_socket(&config.socket_prefix);
        config.discovery = settings.discovery;
        config.connect_timeout = settings.connect_timeout;
        config.read_timeout = settings.read_timeout;
        config.queue_timeout = settings.queue_timeout;
        config.max_queue = settings.max_queue;
        config.quarantine = settings.quarantine;
        config.probe_interval = settings.probe_interval;
        config.scan_interval = settings.scan_interval;
        config.drain_interval = settings.drain_interval;
        config.max_body_bytes = settings.max_body_bytes;
        config.access_log = settings.access_log;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let yaml = r#"
server:
  app_name: blog
  http_port: 8080

pool:
  workers: 3
  max_requests: 2
  socket_dir: /tmp
  hot_reload: process

balancer:
  connect_timeout: 150ms
  queue_timeout: 2s
  discovery: control
  access_log: json

manager:
  restart_base: 500ms
  max_restarts: 5

metrics:
  enabled: true
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.app_name.as_deref(), Some("blog"));
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.pool.hot_reload, HotReload::Process);
        assert_eq!(config.balancer.connect_timeout, Duration::from_millis(150));
        assert_eq!(config.balancer.discovery, DiscoveryMode::Control);
        assert_eq!(config.balancer.access_log, AccessLogFormat::Json);
        assert_eq!(config.manager.restart_base, Duration::from_millis(500));
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
server:
  http_port: 4000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.balancer.probe_interval, Duration::from_millis(500));
        assert_eq!(config.manager.max_restarts, 10);
        assert_eq!(config.platform.port, 3100);
    }

    #[test]
    fn test_invalid_worker_count() {
        let yaml = r#"
pool:
  workers: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_connect_timeout() {
        let yaml = r#"
balancer:
  connect_timeout: 0ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());

        let yaml = r#"
balancer:
  connect_timeout: 1m
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socket_dir_validation() {
        assert!(validate_socket_dir(&PathBuf::from("/tmp")).is_ok());
        assert!(validate_socket_dir(&PathBuf::new()).is_err());
        assert!(validate_socket_dir(&PathBuf::from(format!("/{}", "x".repeat(100)))).is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = Config::load(Some(Path::new("/nonexistent/rip-server.yaml")));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rip-server.yaml");
        std::fs::write(&path, "pool:\n  workers: 4\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.pool.workers, 4);
    }

    #[test]
    fn test_launch_and_component_configs() {
        let mut config = Config::default();
        config.pool.workers = 3;
        config.pool.max_requests = 2;
        config.pool.socket_dir = PathBuf::from("/tmp/rip-sockets");
        config.pool.worker_program = Some(PathBuf::from("/opt/rip/rip-worker"));
        config.balancer.discovery = DiscoveryMode::Control;

        let launch = config.launch("/srv/my app");
        assert_eq!(launch.name, "my app");
        assert_eq!(launch.port, 3000);

        let manager = config.manager_config(&launch);
        assert_eq!(manager.socket_prefix, "rip-my_app");
        assert_eq!(manager.workers, 3);
        assert_eq!(manager.program, PathBuf::from("/opt/rip/rip-worker"));
        assert_eq!(
            manager.control_socket,
            Some(PathBuf::from("/tmp/rip-sockets/rip-my_app-control.sock"))
        );

        let balancer = config.balancer_config(&launch);
        assert_eq!(balancer.socket_prefix, manager.socket_prefix);
        assert_eq!(balancer.socket_dir, manager.socket_dir);
        assert_eq!(Some(balancer.control_socket), manager.control_socket);
    }
}
