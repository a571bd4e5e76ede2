//! rip-server command line

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::pidfile::PidRecord;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use rip_server::{AppServer, Config, Platform};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use worker::signal::terminate_signal;

#[derive(Debug, Parser)]
#[command(name = "rip-server", version, about = "Multi-process application server")]
struct Cli {
    /// Configuration file (default: search the standard locations)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one application in the foreground
    Start {
        /// Application directory
        app_path: PathBuf,

        #[arg(long, short)]
        workers: Option<usize>,

        /// Requests per worker before it is recycled
        #[arg(long, short)]
        requests: Option<u64>,

        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Run the platform controller
    Platform {
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// List running instances
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Stop running instances by app name or port (all when omitted)
    Stop {
        target: Option<String>,

        /// Send SIGKILL instead of SIGTERM
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    common::logging::init_with(config.logging.json(), config.logging.level());

    match cli.command {
        Command::Start {
            app_path,
            workers,
            requests,
            port,
        } => start(config, app_path, workers, requests, port).await,
        Command::Platform { port } => platform(config, port).await,
        Command::Status { json } => status(&config.server.run_dir, json),
        Command::Stop { target, force } => stop(&config.server.run_dir, target.as_deref(), force),
    }
}

async fn start(
    mut config: Config,
    app_path: PathBuf,
    workers: Option<usize>,
    requests: Option<u64>,
    port: Option<u16>,
) -> Result<()> {
    let app_dir = app_path
        .canonicalize()
        .with_context(|| format!("Application directory {} not found", app_path.display()))?;
    if let Some(workers) = workers {
        config.pool.workers = workers;
    }
    if let Some(requests) = requests {
        config.pool.max_requests = requests;
    }
    if let Some(port) = port {
        config.server.http_port = port;
    }
    if config.pool.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let launch = config.launch(&app_dir);
    let server = AppServer::start(&config, launch.clone()).await?;

    let run_dir = config.server.run_dir.clone();
    let record = PidRecord::direct(
        &launch.name,
        server.local_addr().port(),
        launch.workers,
        launch.max_requests,
    );
    match record.write(&run_dir) {
        Ok(path) => info!(record = %path.display(), "PID record written"),
        Err(e) => warn!(error = %e, "Failed to write PID record"),
    }

    terminate_signal().await;
    info!(app = %launch.name, "Shutting down");
    server.stop().await;

    if let Err(e) = record.remove(&run_dir) {
        warn!(error = %e, "Failed to remove PID record");
    }
    Ok(())
}

async fn platform(config: Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.platform.port);
    let addr = format!("{}:{}", config.server.host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let run_dir = config.server.run_dir.clone();
    let record = PidRecord::platform(port);
    if let Err(e) = record.write(&run_dir) {
        warn!(error = %e, "Failed to write PID record");
    }

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        terminate_signal().await;
        token.cancel();
    });

    let platform = Arc::new(Platform::new(config));
    let served = platform.serve(listener, shutdown).await;

    if let Err(e) = record.remove(&run_dir) {
        warn!(error = %e, "Failed to remove PID record");
    }
    served.context("Platform controller failed")
}

/// Live records; records of dead processes are deleted on the way.
fn live_records(run_dir: &Path) -> Result<Vec<PidRecord>> {
    if !run_dir.exists() {
        return Ok(Vec::new());
    }
    let mut live = Vec::new();
    for (path, record) in PidRecord::list(run_dir)? {
        if record.is_alive() {
            live.push(record);
        } else if let Err(e) = std::fs::remove_file(&path) {
            warn!(record = %path.display(), error = %e, "Failed to remove stale PID record");
        }
    }
    Ok(live)
}

fn status(run_dir: &Path, json: bool) -> Result<()> {
    let records = live_records(run_dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No running instances");
        return Ok(());
    }
    println!("{:<8} {:<10} {:<20} {:<8} {:<8} STARTED", "PID", "KIND", "NAME", "PORT", "WORKERS");
    for record in records {
        let (kind, name, port) = match &record.app {
            Some(app) => ("app", app.clone(), record.http_port),
            None => ("platform", "-".to_string(), record.port),
        };
        println!(
            "{:<8} {:<10} {:<20} {:<8} {:<8} {}",
            record.pid,
            kind,
            name,
            port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            record
                .workers
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".into()),
            record.started_at
        );
    }
    Ok(())
}

fn matches_target(record: &PidRecord, target: &str) -> bool {
    if record.app.as_deref() == Some(target) {
        return true;
    }
    match target.parse::<u16>() {
        Ok(port) => record.port == Some(port) || record.http_port == Some(port),
        Err(_) => false,
    }
}

fn stop(run_dir: &Path, target: Option<&str>, force: bool) -> Result<()> {
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let records: Vec<PidRecord> = live_records(run_dir)?
        .into_iter()
        .filter(|record| target.is_none_or(|t| matches_target(record, t)))
        .collect();

    if records.is_empty() {
        match target {
            Some(target) => bail!("No running instance matches '{}'", target),
            None => {
                println!("No running instances");
                return Ok(());
            }
        }
    }

    for record in records {
        let pid = i32::try_from(record.pid).context("PID out of range")?;
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => println!("Sent {} to {}", signal.as_str(), record.pid),
            Err(e) => warn!(pid = record.pid, error = %e, "Failed to signal process"),
        }
        // A SIGTERMed instance removes its own record on the way out
        if force {
            record.remove(run_dir)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["rip-server", "start", "./blog", "-w", "3", "--port", "8080"]);
        match cli.command {
            Command::Start {
                app_path,
                workers,
                requests,
                port,
            } => {
                assert_eq!(app_path, PathBuf::from("./blog"));
                assert_eq!(workers, Some(3));
                assert_eq!(requests, None);
                assert_eq!(port, Some(8080));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::parse_from(["rip-server", "stop", "blog", "--force", "--config", "/tmp/c.yaml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert!(matches!(cli.command, Command::Stop { force: true, .. }));
    }

    #[test]
    fn test_matches_target() {
        let record = PidRecord::direct("blog", 3000, 2, 100);
        assert!(matches_target(&record, "blog"));
        assert!(matches_target(&record, "3000"));
        assert!(!matches_target(&record, "shop"));

        let platform = PidRecord::platform(3100);
        assert!(matches_target(&platform, "3100"));
        assert!(!matches_target(&platform, "blog"));
    }

    #[test]
    fn test_live_records_drops_dead_entries() {
        let dir = tempfile::tempdir().unwrap();
        let live = PidRecord::direct("blog", 3000, 2, 100);
        live.write(dir.path()).unwrap();

        let mut dead = PidRecord::platform(3100);
        dead.pid = i32::MAX as u32;
        let dead_path = dead.write(dir.path()).unwrap();

        let records = live_records(dir.path()).unwrap();
        assert_eq!(records, vec![live]);
        assert!(!dead_path.exists());
    }
}
