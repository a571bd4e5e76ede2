//! Termination signal handling.

use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Resolve once SIGTERM or SIGINT arrives.
pub async fn terminate_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot install SIGTERM handler, relying on SIGINT");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
    }
}
