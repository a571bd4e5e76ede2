//! Application directory watcher driving rolling restarts.

use crate::error::Result;
use crate::pool::Manager;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Watches the application directory and batches relevant changes.
#[derive(Debug, Clone)]
pub struct ReloadWatcher {
    /// Directory to watch (recursively)
    app_dir: PathBuf,

    /// Quiet period that closes a batch of changes
    debounce: Duration,
}

impl ReloadWatcher {
    pub fn new(app_dir: impl Into<PathBuf>) -> Self {
        Self {
            app_dir: app_dir.into(),
            debounce: Duration::from_millis(150),
        }
    }

    /// Set debounce duration
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching; each debounced batch of changed paths is sent on the
    /// returned channel until `shutdown` is cancelled.
    pub fn changes(self, shutdown: CancellationToken) -> Result<mpsc::Receiver<Vec<PathBuf>>> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            Config::default(),
        )?;
        watcher.watch(&self.app_dir, RecursiveMode::Recursive)?;
        info!(app_dir = %self.app_dir.display(), "Watching application for changes");

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                let res = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = raw_rx.recv() => res,
                };
                let Some(res) = res else { break };

                let mut batch = relevant_paths(&self.app_dir, res);
                if batch.is_empty() {
                    continue;
                }
                while let Ok(Some(res)) = tokio::time::timeout(self.debounce, raw_rx.recv()).await {
                    batch.extend(relevant_paths(&self.app_dir, res));
                }

                batch.sort();
                batch.dedup();
                debug!(changed = batch.len(), "Application changed");
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
            debug!("Application watcher stopped");
        });

        Ok(rx)
    }

    /// Run a rolling restart of `manager` for every batch of changes.
    pub fn spawn(self, manager: Arc<Manager>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut changes = self.changes(shutdown)?;
        Ok(tokio::spawn(async move {
            while let Some(paths) = changes.recv().await {
                info!(first = %paths[0].display(), changed = paths.len(), "Reloading workers");
                if let Err(e) = manager.rolling_restart().await {
                    error!(error = %e, "Rolling restart failed");
                }
            }
        }))
    }
}

fn relevant_paths(root: &Path, res: notify::Result<Event>) -> Vec<PathBuf> {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "File watcher error");
            return Vec::new();
        }
    };

    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return Vec::new();
    }

    event
        .paths
        .into_iter()
        .filter(|path| is_relevant(root, path))
        .collect()
}

/// Whether a change to `path` should reload the application.
///
/// Hidden entries, sockets, PID records and editor swap/backup files are
/// ignored.
pub fn is_relevant(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let hidden = relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
    if hidden {
        return false;
    }

    let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    if name.ends_with('~') {
        return false;
    }
    !matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("sock" | "pid" | "swp")
    )
}
