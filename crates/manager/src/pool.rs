//! Worker pool: spawning, supervision, rolling restarts and teardown.

use crate::backoff::{Backoff, ExitKind, RestartDecision, RestartPolicy};
use crate::error::{ManagerError, Result};
use common::format::{socket_path, socket_prefix};
use common::wire::{HotReload, env};
use dashmap::DashMap;
use futures::future::join_all;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Pool settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Application name passed to every worker
    pub app_name: String,

    /// Application directory
    pub app_dir: PathBuf,

    /// Explicit entry file (probed by the worker when absent)
    pub entry: Option<PathBuf>,

    /// Worker executable
    pub program: PathBuf,

    /// Number of slots
    pub workers: usize,

    /// Requests per worker before it retires (0 = unlimited)
    pub max_requests: u64,

    /// Directory holding the worker sockets
    pub socket_dir: PathBuf,

    /// Socket file prefix, `<socket_dir>/<prefix>-<id>.sock`
    pub socket_prefix: String,

    pub hot_reload: HotReload,
    pub log_json: bool,
    pub variant: Option<String>,

    /// Control socket workers register with
    pub control_socket: Option<PathBuf>,

    pub restart: RestartPolicy,

    /// Grace period between SIGTERM and SIGKILL
    pub kill_timeout: Duration,

    /// How long a rolling restart waits for the new socket
    pub ready_timeout: Duration,
}

impl ManagerConfig {
    /// Settings with defaults for everything but the application.
    pub fn new(app_name: impl Into<String>, app_dir: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        let app_name = app_name.into();
        Self {
            socket_prefix: socket_prefix(&app_name),
            app_name,
            app_dir: app_dir.into(),
            entry: None,
            program: program.into(),
            workers: 2,
            max_requests: 10_000,
            socket_dir: std::env::temp_dir(),
            hot_reload: HotReload::None,
            log_json: false,
            variant: None,
            control_socket: None,
            restart: RestartPolicy::default(),
            kill_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
        }
    }

    /// Socket path of slot `id`.
    pub fn socket_path(&self, id: usize) -> PathBuf {
        socket_path(&self.socket_dir, &self.socket_prefix, id)
    }
}

/// Snapshot of one tracked slot
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub id: usize,

    /// Current process, `None` while waiting out a backoff
    pub pid: Option<u32>,

    pub socket_path: PathBuf,
    pub restart_count: u32,
    pub backoff: Duration,

    /// Time since the current process was spawned
    pub uptime: Duration,
}

enum SlotCommand {
    Restart(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
}

/// Live state of a slot, written by its supervisor.
#[derive(Debug)]
struct SlotStatus {
    pid: Option<u32>,
    started_at: Instant,
    restart_count: u32,
    backoff: Duration,
}

struct Slot {
    generation: u64,
    commands: mpsc::Sender<SlotCommand>,
    status: Arc<Mutex<SlotStatus>>,
}

/// Process pool manager
pub struct Manager {
    config: Arc<ManagerConfig>,

    /// Tracked slots by worker id
    slots: Arc<DashMap<usize, Slot>>,

    /// Set while the pool is being torn down; suppresses respawns
    stopping: Arc<AtomicBool>,

    /// One-shot guard for `shutdown`
    shut_down: AtomicBool,

    generation: AtomicU64,
    tracker: TaskTracker,
}

impl Manager {
    /// Create a manager; no process is started until [`Manager::start`].
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config: Arc::new(config),
            slots: Arc::new(DashMap::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            shut_down: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Stop any running pool, then spawn slots `0..workers` in order.
    pub async fn start(&self) -> Result<()> {
        self.stop().await;
        self.stopping.store(false, Ordering::Release);
        std::fs::create_dir_all(&self.config.socket_dir)?;

        info!(
            app = %self.config.app_name,
            workers = self.config.workers,
            max_requests = self.config.max_requests,
            "Starting worker pool"
        );
        for id in 0..self.config.workers {
            self.spawn_worker(id).await?;
        }
        Ok(())
    }

    /// Launch the worker for slot `id` and attach its supervisor.
    ///
    /// A slot already tracked under `id` is stopped first.
    pub async fn spawn_worker(&self, id: usize) -> Result<()> {
        if let Some((_, previous)) = self.slots.remove(&id) {
            stop_slot(id, previous).await;
        }

        let child = spawn_process(&self.config, id)?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel);
        let status = Arc::new(Mutex::new(SlotStatus {
            pid: child.id(),
            started_at: Instant::now(),
            restart_count: 0,
            backoff: self.config.restart.base,
        }));
        let (commands_tx, commands_rx) = mpsc::channel(4);

        let supervisor = Supervisor {
            id,
            generation,
            config: self.config.clone(),
            status: status.clone(),
            commands: commands_rx,
            slots: self.slots.clone(),
            stopping: self.stopping.clone(),
            backoff: Backoff::new(self.config.restart.clone()),
        };

        self.slots.insert(
            id,
            Slot {
                generation,
                commands: commands_tx,
                status,
            },
        );
        self.tracker.spawn(supervisor.run(child));
        Ok(())
    }

    /// Replace every worker one at a time.
    ///
    /// Each replacement waits for its socket (bounded by `ready_timeout`)
    /// before the next slot is touched.
    pub async fn rolling_restart(&self) -> Result<()> {
        let mut ids: Vec<usize> = self.slots.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        info!(app = %self.config.app_name, workers = ids.len(), "Rolling restart");

        for id in ids {
            let commands = match self.slots.get(&id) {
                Some(slot) => slot.commands.clone(),
                None => continue,
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if commands.send(SlotCommand::Restart(reply_tx)).await.is_err() {
                continue;
            }
            match reply_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(worker = id, error = %e, "Worker failed to restart");
                    continue;
                }
                Err(_) => continue,
            }

            let socket = self.config.socket_path(id);
            if !wait_for_file(&socket, self.config.ready_timeout).await {
                warn!(
                    worker = id,
                    socket = %socket.display(),
                    "Replacement did not bind in time, continuing"
                );
            }
        }
        Ok(())
    }

    /// Kill every tracked worker and delete the socket files.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Release);

        let ids: Vec<usize> = self.slots.iter().map(|entry| *entry.key()).collect();
        let slots: Vec<(usize, Slot)> = ids
            .into_iter()
            .filter_map(|id| self.slots.remove(&id))
            .collect();
        if slots.is_empty() {
            return;
        }

        info!(app = %self.config.app_name, workers = slots.len(), "Stopping worker pool");
        join_all(slots.into_iter().map(|(id, slot)| stop_slot(id, slot))).await;

        for id in 0..self.config.workers {
            remove_socket(&self.config.socket_path(id));
        }
    }

    /// Stop the pool once; later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop().await;
        self.tracker.close();
        self.tracker.wait().await;
        info!(app = %self.config.app_name, "Manager shut down");
    }

    /// Snapshot of the tracked slots, ordered by id.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .slots
            .iter()
            .map(|entry| {
                let status = entry.status.lock();
                WorkerInfo {
                    id: *entry.key(),
                    pid: status.pid,
                    socket_path: self.config.socket_path(*entry.key()),
                    restart_count: status.restart_count,
                    backoff: status.backoff,
                    uptime: status.started_at.elapsed(),
                }
            })
            .collect();
        workers.sort_by_key(|w| w.id);
        workers
    }
}

async fn stop_slot(id: usize, slot: Slot) {
    let (reply_tx, reply_rx) = oneshot::channel();
    if slot.commands.send(SlotCommand::Stop(reply_tx)).await.is_ok() {
        let _ = reply_rx.await;
    }
    debug!(worker = id, "Slot stopped");
}

/// Owns one slot's child process for its whole life.
struct Supervisor {
    id: usize,
    generation: u64,
    config: Arc<ManagerConfig>,
    status: Arc<Mutex<SlotStatus>>,
    commands: mpsc::Receiver<SlotCommand>,
    slots: Arc<DashMap<usize, Slot>>,
    stopping: Arc<AtomicBool>,
    backoff: Backoff,
}

enum Event {
    Exited(std::io::Result<ExitStatus>),
    Command(Option<SlotCommand>),
}

impl Supervisor {
    async fn run(mut self, mut child: Child) {
        loop {
            let event = tokio::select! {
                exit = child.wait() => Event::Exited(exit),
                command = self.commands.recv() => Event::Command(command),
            };

            match event {
                Event::Command(Some(SlotCommand::Restart(reply))) => {
                    terminate(self.id, &mut child, self.config.kill_timeout).await;
                    match self.spawn() {
                        Ok(next) => {
                            child = next;
                            let _ = reply.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                            match self.recover(ExitKind::Crashed, Duration::ZERO).await {
                                Some(next) => child = next,
                                None => return,
                            }
                        }
                    }
                }
                Event::Command(command) => {
                    terminate(self.id, &mut child, self.config.kill_timeout).await;
                    self.finish(command);
                    return;
                }
                Event::Exited(exit) => {
                    let ran_for = self.status.lock().started_at.elapsed();
                    self.status.lock().pid = None;

                    if self.stopping.load(Ordering::Acquire) {
                        debug!(worker = self.id, "Worker exited during shutdown");
                        self.wait_for_stop().await;
                        return;
                    }

                    let kind = match &exit {
                        Ok(status) if status.success() => {
                            info!(worker = self.id, "Worker retired");
                            ExitKind::Retired
                        }
                        Ok(status) => {
                            warn!(worker = self.id, %status, ran_for = ?ran_for, "Worker exited unexpectedly");
                            ExitKind::Crashed
                        }
                        Err(e) => {
                            warn!(worker = self.id, error = %e, "Failed to await worker");
                            ExitKind::Crashed
                        }
                    };

                    match self.recover(kind, ran_for).await {
                        Some(next) => child = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Apply the restart policy until a new process is running.
    ///
    /// Returns `None` when the slot is stopped or abandoned.
    async fn recover(&mut self, mut kind: ExitKind, mut ran_for: Duration) -> Option<Child> {
        loop {
            let decision = self.backoff.on_exit(kind, ran_for);
            {
                let mut status = self.status.lock();
                status.restart_count = self.backoff.restart_count();
                status.backoff = self.backoff.backoff();
            }

            match decision {
                RestartDecision::RespawnNow => {}
                RestartDecision::RespawnAfter(delay) => {
                    info!(
                        worker = self.id,
                        restart_count = self.backoff.restart_count(),
                        delay = ?delay,
                        "Respawning after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        command = self.commands.recv() => match command {
                            Some(SlotCommand::Restart(reply)) => {
                                let _ = reply.send(Ok(()));
                            }
                            other => {
                                self.finish(other);
                                return None;
                            }
                        },
                    }
                }
                RestartDecision::GiveUp => {
                    error!(
                        worker = self.id,
                        restarts = self.backoff.restart_count() - 1,
                        "Worker keeps crashing, abandoning slot"
                    );
                    self.slots
                        .remove_if(&self.id, |_, slot| slot.generation == self.generation);
                    remove_socket(&self.config.socket_path(self.id));
                    return None;
                }
            }

            if self.stopping.load(Ordering::Acquire) {
                self.wait_for_stop().await;
                return None;
            }

            match self.spawn() {
                Ok(child) => return Some(child),
                Err(e) => {
                    error!(worker = self.id, error = %e, "Failed to respawn worker");
                    kind = ExitKind::Crashed;
                    ran_for = Duration::ZERO;
                }
            }
        }
    }

    fn spawn(&self) -> Result<Child> {
        let child = spawn_process(&self.config, self.id)?;
        let mut status = self.status.lock();
        status.pid = child.id();
        status.started_at = Instant::now();
        Ok(child)
    }

    /// Wait for the stop request that follows a pool-wide shutdown.
    async fn wait_for_stop(&mut self) {
        let command = self.commands.recv().await;
        self.finish(command);
    }

    fn finish(&self, command: Option<SlotCommand>) {
        remove_socket(&self.config.socket_path(self.id));
        match command {
            Some(SlotCommand::Stop(reply)) => {
                let _ = reply.send(());
            }
            Some(SlotCommand::Restart(reply)) => {
                let _ = reply.send(Err(ManagerError::SlotGone(self.id)));
            }
            None => {}
        }
    }
}

/// Launch the worker program for slot `id`.
fn spawn_process(config: &ManagerConfig, id: usize) -> Result<Child> {
    let socket = config.socket_path(id);
    remove_socket(&socket);

    let entry = config
        .entry
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let mut command = Command::new(&config.program);
    command
        .arg(id.to_string())
        .arg(config.max_requests.to_string())
        .arg(&config.app_dir)
        .arg(entry)
        .arg(&config.app_name)
        .env(env::WORKER_ID, id.to_string())
        .env(env::APP_NAME, &config.app_name)
        .env(env::SOCKET_PATH, &socket)
        .env(env::SOCKET_PREFIX, &config.socket_prefix)
        .env(env::LOG_JSON, if config.log_json { "1" } else { "0" })
        .env(env::HOT_RELOAD, config.hot_reload.as_str())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(variant) = &config.variant {
        command.env(env::VARIANT, variant);
    }
    if let Some(control) = &config.control_socket {
        command.env(env::CONTROL_SOCKET, control);
    }

    let child = command.spawn().map_err(|source| ManagerError::Spawn {
        program: config.program.clone(),
        source,
    })?;
    info!(
        worker = id,
        pid = child.id(),
        socket = %socket.display(),
        "Worker spawned"
    );
    Ok(child)
}

/// SIGTERM, then SIGKILL once `kill_timeout` has passed.
async fn terminate(id: usize, child: &mut Child, kill_timeout: Duration) {
    let Some(pid) = child.id() else {
        let _ = child.wait().await;
        return;
    };

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(worker = id, pid, error = %e, "SIGTERM failed");
    }
    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(_) => debug!(worker = id, pid, "Worker terminated"),
        Err(_) => {
            warn!(worker = id, pid, "Worker ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                debug!(worker = id, pid, error = %e, "SIGKILL failed");
            }
        }
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

async fn wait_for_file(path: &Path, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    path.exists()
}
