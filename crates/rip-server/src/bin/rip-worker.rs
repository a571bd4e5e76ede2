//! Worker process spawned by the rip manager, one per pool slot.

use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use worker::{LoaderProvider, Worker, WorkerArgs, signal::terminate_signal};

fn main() -> ExitCode {
    let args = match WorkerArgs::from_env() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("rip-worker: {}", e);
            return ExitCode::from(2);
        }
    };
    common::logging::init_with(args.log_json, "info");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: WorkerArgs) -> worker::Result<()> {
    let provider = LoaderProvider::new(&args.app_dir, args.entry.clone(), args.hot_reload);
    provider.load()?;

    let worker = Worker::new(args.to_config(), Arc::new(provider));
    let token = worker.shutdown_token();
    info!(
        worker = args.id,
        app = %args.app_name,
        socket = %args.socket_path.display(),
        variant = args.variant.as_deref().unwrap_or("default"),
        "Worker starting"
    );

    tokio::spawn(async move {
        terminate_signal().await;
        token.cancel();
    });
    worker.run().await
}
