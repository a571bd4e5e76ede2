//! One running application: a worker pool behind its load balancer.

use crate::config::{AppLaunch, Config};
use balancer::{BalancerError, BalancerStats, LoadBalancer, MetricsRegistry, MetricsServer};
use common::wire::{HotReload, StatusSnapshot};
use manager::{Manager, ManagerError, ReloadWatcher, WorkerInfo};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Balancer(#[from] BalancerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A started Manager + LoadBalancer pair.
pub struct AppServer {
    launch: AppLaunch,
    local_addr: SocketAddr,
    manager: Arc<Manager>,
    lb: LoadBalancer,
    /// Cancels the balancer and metrics endpoint
    shutdown: CancellationToken,
    /// Cancels the reload watcher
    reload: CancellationToken,
    tasks: TaskTracker,
}

impl AppServer {
    /// Bind the public port, start the balancer, then the workers.
    ///
    /// The balancer comes first so that control-socket registrations from
    /// the new workers have somewhere to go.
    pub async fn start(config: &Config, launch: AppLaunch) -> Result<Self, AppError> {
        let addr = format!("{}:{}", config.server.host, launch.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| AppError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let reload = CancellationToken::new();
        let tasks = TaskTracker::new();

        let metrics = config
            .metrics
            .enabled
            .then(|| Arc::new(MetricsRegistry::new()));
        if let Some(registry) = &metrics {
            let server = MetricsServer::new(registry.clone(), config.metrics.listen_addr.clone());
            let token = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = server.run(token).await {
                    error!(error = %e, "Metrics server failed");
                }
            });
        }

        let lb = LoadBalancer::new(config.balancer_config(&launch), metrics);
        lb.spawn_background(&shutdown)?;
        {
            let lb = lb.clone();
            let token = shutdown.clone();
            let app = launch.name.clone();
            tasks.spawn(async move {
                if let Err(e) = lb.serve_started(listener, token).await {
                    error!(app = %app, error = %e, "Load balancer failed");
                }
            });
        }

        let manager = Arc::new(Manager::new(config.manager_config(&launch)));
        if let Err(e) = manager.start().await {
            manager.shutdown().await;
            shutdown.cancel();
            tasks.close();
            tasks.wait().await;
            return Err(e.into());
        }

        if config.pool.hot_reload == HotReload::Process {
            let watcher = ReloadWatcher::new(&launch.dir).with_debounce(config.manager.watch_debounce);
            let handle = watcher.spawn(manager.clone(), reload.clone())?;
            tasks.spawn(async move {
                let _ = handle.await;
            });
        }

        info!(
            app = %launch.name,
            addr = %local_addr,
            workers = launch.workers,
            "Application started"
        );
        Ok(Self {
            launch,
            local_addr,
            manager,
            lb,
            shutdown,
            reload,
            tasks,
        })
    }

    pub fn name(&self) -> &str {
        &self.launch.name
    }

    pub fn launch(&self) -> &AppLaunch {
        &self.launch
    }

    /// Address the balancer is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> StatusSnapshot {
        self.lb.status()
    }

    pub fn stats(&self) -> BalancerStats {
        self.lb.stats()
    }

    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.manager.workers()
    }

    /// Replace the workers one at a time.
    pub async fn restart(&self) -> Result<(), AppError> {
        self.manager.rolling_restart().await?;
        Ok(())
    }

    /// Stop the workers, then the balancer.
    pub async fn stop(self) {
        self.reload.cancel();
        self.manager.shutdown().await;
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!(app = %self.launch.name, "Application stopped");
    }
}
