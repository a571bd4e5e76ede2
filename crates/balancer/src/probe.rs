//! Background readiness probing.

use crate::config::DiscoveryMode;
use crate::server::LoadBalancer;
use futures::future::join_all;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Probe every known socket each `probe_interval` until cancelled.
pub async fn probe_loop(lb: LoadBalancer, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(lb.config().probe_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => probe_once(&lb).await,
        }
    }
    debug!("Probe loop stopped");
}

/// One probe round over the non-quarantined sockets.
pub async fn probe_once(lb: &LoadBalancer) {
    if lb.config().discovery == DiscoveryMode::Control {
        prune_vanished(lb);
    }
    let targets = lb.with_upstreams(|set| set.probe_targets(Instant::now()));
    probe_sockets(lb, targets).await;
}

/// Probe `sockets` concurrently and record the results.
pub async fn probe_sockets(lb: &LoadBalancer, sockets: Vec<PathBuf>) {
    if sockets.is_empty() {
        return;
    }

    let deadline = lb.config().probe_interval;
    let client = lb.client();
    let results = join_all(sockets.into_iter().map(|socket| async move {
        let ready = client.probe(&socket, deadline).await;
        (socket, ready)
    }))
    .await;

    lb.with_upstreams(|set| {
        for (socket, ready) in results {
            // Taken for a request while the probe ran
            let Some(was) = set.get(&socket).filter(|u| !u.inflight).map(|u| u.ready) else {
                continue;
            };
            if was != ready {
                info!(socket = %socket.display(), ready, "Upstream readiness changed");
            }
            set.set_ready(&socket, ready);
        }
    });
}

/// Drop sockets whose file no longer exists.
fn prune_vanished(lb: &LoadBalancer) {
    lb.with_upstreams(|set| {
        let gone: Vec<PathBuf> = set
            .iter()
            .filter(|u| !u.socket.exists())
            .map(|u| u.socket.clone())
            .collect();
        for socket in gone {
            info!(socket = %socket.display(), "Upstream socket vanished");
            set.remove(&socket);
        }
    });
}
