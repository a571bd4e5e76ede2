//! Unix socket server hosting one application handler.

use crate::error::{Result, WorkerError};
use crate::handler::HandlerProvider;
use crate::registration::ControlClient;
use bytes::Bytes;
use common::wire::{
    ControlMessage, READY_PATH, WORKER_BUSY_HEADER, WORKER_ID_HEADER, WORKER_TIME_HEADER,
};
use futures::FutureExt;
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Poll interval while waiting for the in-flight request to finish.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Worker settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable index within the pool
    pub id: usize,

    /// Application name (for registration and logs)
    pub app_name: String,

    /// Socket this worker binds
    pub socket_path: PathBuf,

    /// Requests served before the worker retires (0 = unlimited)
    pub max_requests: u64,

    /// Control socket for self-registration
    pub control_socket: Option<PathBuf>,
}

/// Shared per-process state.
struct WorkerState {
    id: usize,
    max_requests: u64,
    inflight: AtomicBool,
    stopping: AtomicBool,
    handled: AtomicU64,
    shutdown: CancellationToken,
    provider: Arc<dyn HandlerProvider>,
}

/// Clears the in-flight flag when dropped.
struct InflightGuard<'a>(&'a AtomicBool);

impl<'a> InflightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InflightGuard(flag))
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Worker server
pub struct Worker {
    config: WorkerConfig,
    state: Arc<WorkerState>,
}

impl Worker {
    /// Create a new worker
    pub fn new(config: WorkerConfig, provider: Arc<dyn HandlerProvider>) -> Self {
        let state = Arc::new(WorkerState {
            id: config.id,
            max_requests: config.max_requests,
            inflight: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            handled: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            provider,
        });
        Self { config, state }
    }

    /// Token that starts a graceful shutdown when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Requests handled so far.
    pub fn handled(&self) -> u64 {
        self.state.handled.load(Ordering::Acquire)
    }

    /// Serve until shutdown or retirement.
    ///
    /// Fails only at start-up (handler load or socket bind).
    pub async fn run(self) -> Result<()> {
        self.state.provider.get()?;

        let socket_path = &self.config.socket_path;
        remove_socket(socket_path);
        let listener = UnixListener::bind(socket_path).map_err(|source| WorkerError::Bind {
            path: socket_path.clone(),
            source,
        })?;
        info!(
            worker = self.config.id,
            pid = std::process::id(),
            socket = %socket_path.display(),
            max_requests = self.config.max_requests,
            "Worker listening"
        );

        let control = self
            .config
            .control_socket
            .as_ref()
            .map(|path| ControlClient::new(path.clone()));
        if let Some(control) = &control {
            control.notify(ControlMessage::Register {
                app: self.config.app_name.clone(),
                worker_id: self.config.id,
                pid: std::process::id(),
                socket: socket_path.display().to_string(),
            });
        }

        let tracker = TaskTracker::new();
        let shutdown = self.state.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.state.stopping.store(true, Ordering::Release);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tracker.spawn(serve_connection(stream, self.state.clone()));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }

        drop(listener);
        debug!(worker = self.config.id, "Listener closed, waiting for in-flight request");

        while self.state.inflight.load(Ordering::Acquire) {
            tokio::time::sleep(IDLE_POLL).await;
        }
        tracker.close();
        tracker.wait().await;

        if let Some(control) = &control {
            let message = ControlMessage::Deregister {
                app: self.config.app_name.clone(),
                worker_id: self.config.id,
                socket: socket_path.display().to_string(),
            };
            if let Err(e) = control.send(&message).await {
                debug!(error = %e, "Deregistration not delivered");
            }
        }

        remove_socket(socket_path);
        info!(
            worker = self.config.id,
            handled = self.handled(),
            "Worker stopped"
        );
        Ok(())
    }
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

async fn serve_connection(stream: UnixStream, state: Arc<WorkerState>) {
    let shutdown = state.shutdown.clone();
    let service = service_fn(move |request| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle(request, &state).await) }
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                debug!(error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            if let Err(e) = connection.await {
                debug!(error = %e, "Connection closed with error during shutdown");
            }
        }
    }
}

async fn handle(request: Request<Incoming>, state: &WorkerState) -> Response<Full<Bytes>> {
    if request.method() == Method::GET && request.uri().path() == READY_PATH {
        let body = if state.provider.is_loaded() { "ok" } else { "not-ready" };
        return text(StatusCode::OK, body);
    }

    if state.stopping.load(Ordering::Acquire) {
        return busy();
    }
    let Some(guard) = InflightGuard::acquire(&state.inflight) else {
        return busy();
    };

    let started = Instant::now();
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return text(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    let response = invoke(state, Request::from_parts(parts, body)).await;

    let handled = state.handled.fetch_add(1, Ordering::AcqRel) + 1;
    if state.max_requests > 0 && handled >= state.max_requests {
        state.stopping.store(true, Ordering::Release);
        info!(worker = state.id, handled, "Request limit reached, retiring");
        state.shutdown.cancel();
    }
    drop(guard);

    let (mut parts, body) = response.into_parts();
    parts.headers.insert(WORKER_ID_HEADER, HeaderValue::from(state.id));
    let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
    if let Ok(value) = HeaderValue::from_str(&format!("{:.3}", elapsed_ms)) {
        parts.headers.insert(WORKER_TIME_HEADER, value);
    }
    Response::from_parts(parts, Full::new(body))
}

async fn invoke(state: &WorkerState, request: Request<Bytes>) -> Response<Bytes> {
    if let Err(e) = state.provider.refresh() {
        warn!(error = %e, "Reload failed, keeping previous handler");
    }

    let handler = match state.provider.get() {
        Ok(handler) => handler,
        Err(e) => {
            error!(error = %e, "No handler available");
            return internal_error();
        }
    };

    match AssertUnwindSafe(handler.invoke(request)).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(worker = state.id, error = %e, "Handler failed");
            internal_error()
        }
        Err(_) => {
            error!(worker = state.id, "Handler panicked");
            internal_error()
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn busy() -> Response<Full<Bytes>> {
    let mut response = text(StatusCode::SERVICE_UNAVAILABLE, "busy");
    let headers = response.headers_mut();
    headers.insert(WORKER_BUSY_HEADER, HeaderValue::from_static("1"));
    headers.insert(header::RETRY_AFTER, HeaderValue::from_static("0"));
    response
}

fn internal_error() -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(b"Internal Server Error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inflight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = InflightGuard::acquire(&flag).unwrap();
        assert!(InflightGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert!(InflightGuard::acquire(&flag).is_some());
    }

    #[test]
    fn test_busy_response_carries_sentinel() {
        let response = busy();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[WORKER_BUSY_HEADER], "1");
        assert_eq!(response.headers()[header::RETRY_AFTER], "0");
    }
}
