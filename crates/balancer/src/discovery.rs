//! Worker socket discovery: directory scan or control-socket registration.

use crate::error::{BalancerError, Result};
use crate::probe::probe_sockets;
use crate::server::LoadBalancer;
use bytes::Bytes;
use common::format::parse_worker_id;
use common::wire::{CONTROL_PATH, ControlMessage};
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker sockets in `dir` named `<prefix>-<id>.sock`, ordered by id.
pub fn scan(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(id) = parse_worker_id(&name.to_string_lossy(), prefix) {
            found.push((id, entry.path()));
        }
    }
    found.sort_by_key(|(id, _)| *id);
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

/// Reconcile the upstream table with the socket directory.
pub async fn scan_once(lb: &LoadBalancer) {
    let config = lb.config();
    let found = match scan(&config.socket_dir, &config.socket_prefix) {
        Ok(found) => found,
        Err(e) => {
            warn!(dir = %config.socket_dir.display(), error = %e, "Socket scan failed");
            return;
        }
    };

    let (added, before, after) = lb.with_upstreams(|set| {
        let before = set.len();
        let added = set.reconcile(found);
        (added, before, set.len())
    });
    if !added.is_empty() || before != after {
        info!(added = added.len(), upstreams = after, "Upstream sockets changed");
    }
    // New sockets are probed right away instead of waiting for the next round
    probe_sockets(lb, added).await;
}

/// Scan every `scan_interval` until cancelled.
pub async fn scan_loop(lb: LoadBalancer, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(lb.config().scan_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => scan_once(&lb).await,
        }
    }
    debug!("Scan loop stopped");
}

/// Bind the control socket, replacing a stale file.
pub fn bind_control(path: &Path) -> Result<UnixListener> {
    remove_control(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path).map_err(|source| BalancerError::Bind {
        path: path.to_path_buf(),
        source,
    })?;
    info!(socket = %path.display(), "Control socket listening");
    Ok(listener)
}

pub fn remove_control(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(socket = %path.display(), error = %e, "Failed to remove control socket");
        }
    }
}

/// Accept registrations until cancelled.
pub async fn control_loop(lb: LoadBalancer, listener: UnixListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_control(lb.clone(), stream));
                }
                Err(e) => warn!(error = %e, "Control accept failed"),
            },
        }
    }
    debug!("Control loop stopped");
}

async fn serve_control(lb: LoadBalancer, stream: UnixStream) {
    let service = service_fn(move |request| {
        let lb = lb.clone();
        async move { Ok::<_, Infallible>(handle_control(&lb, request).await) }
    });
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(error = %e, "Control connection closed with error");
    }
}

async fn handle_control(lb: &LoadBalancer, request: Request<Incoming>) -> Response<Full<Bytes>> {
    if request.method() != Method::POST || request.uri().path() != CONTROL_PATH {
        return reply(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#);
    }

    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read control message");
            return reply(StatusCode::BAD_REQUEST, r#"{"error":"unreadable body"}"#);
        }
    };
    let message: ControlMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Malformed control message");
            return reply(StatusCode::BAD_REQUEST, r#"{"error":"malformed message"}"#);
        }
    };

    apply(lb, message);
    reply(StatusCode::OK, r#"{"ok":true}"#)
}

/// Apply a registration message to the upstream table.
pub fn apply(lb: &LoadBalancer, message: ControlMessage) {
    if message.app() != lb.config().app_name {
        warn!(app = message.app(), "Ignoring control message for another application");
        return;
    }

    let socket = PathBuf::from(message.socket());
    match message {
        ControlMessage::Register { worker_id, pid, .. } => {
            if lb.with_upstreams(|set| set.insert(socket.clone())) {
                info!(worker = worker_id, pid, socket = %socket.display(), "Worker registered");
                let lb = lb.clone();
                tokio::spawn(async move { probe_sockets(&lb, vec![socket]).await });
            }
        }
        ControlMessage::Deregister { worker_id, .. } => {
            if lb.with_upstreams(|set| set.remove(&socket)) {
                info!(worker = worker_id, socket = %socket.display(), "Worker deregistered");
            }
        }
    }
}

fn reply(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerConfig;

    #[test]
    fn test_scan_matches_prefix_and_orders_by_id() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "rip-app-10.sock",
            "rip-app-2.sock",
            "rip-app-control.sock",
            "rip-other-1.sock",
            "rip-app-3.pid",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let found = scan(dir.path(), "rip-app").unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("rip-app-2.sock"), dir.path().join("rip-app-10.sock")]
        );
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let lb = LoadBalancer::new(BalancerConfig::new("app", 0), None);
        let register = ControlMessage::Register {
            app: "app".to_string(),
            worker_id: 0,
            pid: 1,
            socket: "/tmp/rip-app-0.sock".to_string(),
        };
        apply(&lb, register.clone());
        apply(&lb, register);
        assert_eq!(lb.upstream_sockets(), vec![PathBuf::from("/tmp/rip-app-0.sock")]);

        apply(
            &lb,
            ControlMessage::Register {
                app: "elsewhere".to_string(),
                worker_id: 1,
                pid: 2,
                socket: "/tmp/rip-elsewhere-1.sock".to_string(),
            },
        );
        assert_eq!(lb.upstream_sockets().len(), 1);

        apply(
            &lb,
            ControlMessage::Deregister {
                app: "app".to_string(),
                worker_id: 0,
                socket: "/tmp/rip-app-0.sock".to_string(),
            },
        );
        assert!(lb.upstream_sockets().is_empty());
    }
}
